//! Consumes the child's stdout channel, extracting progress telemetry and
//! feeding the Telemetry Ring (C4).

use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use moe_common::{models::Progress, prelude::*, telemetry::TelemetryRing};
use regex::Regex;
use tokio::sync::mpsc;

/// Shared handle to the progress of whichever job is currently running.
///
/// Spec models this as "written by the Parser via a single-producer
/// channel"; there is in practice exactly one writer (the Parser task) and
/// every reader only ever wants the latest value, so a plain mutex serves
/// that role without the extra machinery of an actual channel type.
pub type SharedProgress = Arc<Mutex<Progress>>;

lazy_static! {
    static ref PROGRESS_RE: Regex =
        Regex::new(r"\[\s*Iteration\s*(\d+)\s*\].*Entropy:\s*([\d.]+)").expect("valid regex");
}

/// Consume `stdout` until the channel closes (the child's stdout reached
/// EOF), appending every line to `ring` and updating `progress` whenever a
/// line matches the progress pattern.
#[instrument(skip_all, level = "trace")]
pub async fn run(mut stdout: mpsc::Receiver<String>, ring: TelemetryRing, progress: SharedProgress) {
    while let Some(line) = stdout.recv().await {
        ring.push(line.clone());
        if let Some(captures) = PROGRESS_RE.captures(&line) {
            let parsed = captures
                .get(1)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .zip(captures.get(2).and_then(|m| m.as_str().parse::<f64>().ok()));
            match parsed {
                Some((iteration, entropy)) => {
                    let mut progress = progress.lock().expect("progress mutex poisoned");
                    progress.observe(iteration, entropy);
                }
                None => warn!("progress line matched pattern but failed to parse: {line}"),
            }
        }
    }
}

#[test]
fn extracts_iteration_and_entropy() {
    let caps = PROGRESS_RE
        .captures("[ Iteration 5 ] some noise Entropy: 1.2345")
        .unwrap();
    assert_eq!(&caps[1], "5");
    assert_eq!(&caps[2], "1.2345");
}

#[test]
fn non_matching_line_has_no_captures() {
    assert!(PROGRESS_RE.captures("just some log output").is_none());
}

#[tokio::test]
async fn run_updates_ring_and_progress_then_stops_at_close() {
    let (tx, rx) = mpsc::channel(4);
    let ring = TelemetryRing::new(10);
    let progress: SharedProgress = Arc::new(Mutex::new(Progress::new()));

    tx.send("starting up".to_owned()).await.unwrap();
    tx.send("[ Iteration 3 ] working, Entropy: 0.75".to_owned())
        .await
        .unwrap();
    drop(tx);

    run(rx, ring.clone(), progress.clone()).await;

    assert_eq!(ring.snapshot().len(), 2);
    let progress = progress.lock().unwrap();
    assert_eq!(progress.current_iteration, Some(3));
    assert_eq!(progress.current_entropy, Some(0.75));
}
