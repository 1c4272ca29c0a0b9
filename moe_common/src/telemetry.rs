//! The bounded ring of recent stdout lines the UI reads (C4).

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// A bounded, concurrency-safe ring of the last `capacity` stdout lines.
///
/// Cloning a `TelemetryRing` gives you another handle to the same
/// underlying ring (it wraps an `Arc`), matching the single-writer,
/// multi-reader usage in spec §3/§5: the Parser is the only writer, the UI
/// (and tests) only ever call [`TelemetryRing::snapshot`].
#[derive(Clone, Debug)]
pub struct TelemetryRing {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    lines: VecDeque<String>,
}

impl TelemetryRing {
    /// Create a new ring retaining at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        TelemetryRing {
            inner: Arc::new(Mutex::new(Inner {
                capacity: capacity.max(1),
                lines: VecDeque::with_capacity(capacity.max(1)),
            })),
        }
    }

    /// Append a line, evicting the oldest line if we're at capacity.
    pub fn push(&self, line: String) {
        let mut inner = self.inner.lock().expect("telemetry ring mutex poisoned");
        if inner.lines.len() >= inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line);
    }

    /// Return a snapshot of the ring's current contents, oldest first.
    ///
    /// Readers never block writers: this just clones out the current
    /// contents under the lock and releases it immediately.
    pub fn snapshot(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("telemetry ring mutex poisoned");
        inner.lines.iter().cloned().collect()
    }
}

#[test]
fn evicts_oldest_beyond_capacity() {
    let ring = TelemetryRing::new(3);
    for i in 0..5 {
        ring.push(format!("line {i}"));
    }
    assert_eq!(
        ring.snapshot(),
        vec!["line 2".to_owned(), "line 3".to_owned(), "line 4".to_owned()]
    );
}

#[test]
fn snapshot_preserves_insertion_order() {
    let ring = TelemetryRing::new(10);
    ring.push("first".to_owned());
    ring.push("second".to_owned());
    ring.push("third".to_owned());
    assert_eq!(
        ring.snapshot(),
        vec!["first".to_owned(), "second".to_owned(), "third".to_owned()]
    );
}

#[test]
fn snapshot_length_never_exceeds_capacity() {
    let ring = TelemetryRing::new(10);
    for i in 0..100 {
        ring.push(format!("{i}"));
        assert!(ring.snapshot().len() <= 10);
    }
}

#[test]
fn clone_shares_the_same_ring() {
    let ring = TelemetryRing::new(5);
    let handle = ring.clone();
    ring.push("via original".to_owned());
    handle.push("via clone".to_owned());
    assert_eq!(ring.snapshot(), handle.snapshot());
}
