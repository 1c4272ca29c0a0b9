//! Per-job progress, as extracted from the compute child's stdout.

/// The mutable progress state for the job currently being run.
///
/// Owned by the Job Runner; written by the Output Parser via a
/// single-producer channel. Reset whenever a new job is fetched.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Progress {
    /// The highest iteration number observed so far, if any.
    pub current_iteration: Option<u64>,
    /// The most recently observed entropy value, if any.
    pub current_entropy: Option<f64>,
}

impl Progress {
    /// A fresh, empty progress state.
    pub fn new() -> Self {
        Progress::default()
    }

    /// Record a new `(iteration, entropy)` observation.
    ///
    /// Enforces the monotonicity invariant: an iteration number lower than
    /// what we've already seen is ignored rather than regressing the
    /// recorded progress.
    pub fn observe(&mut self, iteration: u64, entropy: f64) {
        let is_advance = match self.current_iteration {
            Some(i) => iteration >= i,
            None => true,
        };
        if is_advance {
            self.current_iteration = Some(iteration);
            self.current_entropy = Some(entropy);
        }
    }
}

#[test]
fn observe_is_monotonic() {
    let mut progress = Progress::new();
    progress.observe(5, 1.5);
    assert_eq!(progress.current_iteration, Some(5));
    progress.observe(3, 0.1);
    assert_eq!(
        progress.current_iteration,
        Some(5),
        "a lower iteration must not regress recorded progress"
    );
    progress.observe(7, 0.9);
    assert_eq!(progress.current_iteration, Some(7));
    assert_eq!(progress.current_entropy, Some(0.9));
}
