//! Periodically notifies the server that the current job is alive (C5).

use std::{sync::Arc, time::Duration};

use moe_common::{prelude::*, rest_api::Client};

use crate::controller::SharedState;

/// Run the heartbeat loop until `state` is stopped.
///
/// A ping failure is logged but never escalated: the server is
/// authoritative about reassignment, not this loop (spec §4.5). Pings are
/// only sent while the Job Runner reports a phase eligible for heartbeats
/// (spec §8 invariant 3).
#[instrument(skip_all, level = "trace")]
pub async fn run(client: Arc<Client>, state: Arc<SharedState>, interval: Duration) {
    loop {
        if state.is_stopped() {
            return;
        }
        if let Some(job_id) = state.current_job_id() {
            if state.heartbeat_eligible() {
                if let Err(err) = client.ping_job(job_id).await {
                    warn!("heartbeat ping for job {job_id} failed: {err:#}");
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use moe_common::config::WorkerConfig;

    use super::*;

    #[tokio::test]
    async fn loop_never_pings_without_an_assigned_job() {
        let client = Arc::new(Client::new(&WorkerConfig::default()).unwrap());
        let state = Arc::new(SharedState::default());

        // No job is ever assigned, so `heartbeat_eligible` stays false and
        // `ping_job` (which would hit the network) is never called; the loop
        // just keeps sleeping, so the timeout below must elapse rather than
        // the future resolving on its own.
        let result = tokio::time::timeout(
            Duration::from_millis(30),
            run(client, state, Duration::from_millis(5)),
        )
        .await;
        assert!(result.is_err());
    }
}
