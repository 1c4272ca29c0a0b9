//! Process-wide worker lifecycle: login, start/pause/stop, and the
//! read-only state snapshot the UI observes (C7).

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use moe_common::{artifact_index::ArtifactIndex, prelude::*, rest_api::Client, telemetry::TelemetryRing};
use tokio::task::JoinHandle;

use crate::{heartbeat, job_runner, parser::SharedProgress, process::Supervisor};

/// Where a job is in the Job Runner's state machine. Read by the Heartbeat
/// Loop (invariant: heartbeats fire only during `Running`/`Uploading`/
/// `Completing`) and by the Controller's UI-facing snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum JobPhase {
    /// No job is currently being worked on.
    #[default]
    Idle,
    /// A job was just fetched; inputs are being acquired.
    HaveJob,
    /// The compute child is running.
    Running,
    /// The child exited successfully; outputs are being uploaded.
    Uploading,
    /// The upload succeeded; the server is being notified of completion.
    Completing,
    /// A stop was requested while a `minimize` job was running; the
    /// partial-progress flush is underway.
    Cancelling,
}

/// State shared between the Controller, the Job Runner, and the Heartbeat
/// Loop. Each field documents which task is allowed to write it.
#[derive(Default)]
pub struct SharedState {
    /// Written by the Controller only.
    running: AtomicBool,
    /// Written by the Controller only. Once true, never reset to false.
    stopped: AtomicBool,
    /// Written by the Job Runner only.
    phase: Mutex<JobPhase>,
    /// Written by the Job Runner only.
    job: Mutex<Option<Job>>,
    /// Written by the Controller only.
    username: Mutex<Option<String>>,
    /// Written by the Controller only, each time `is_logged_in` revalidates.
    last_auth_check: Mutex<Option<DateTime<Utc>>>,
    /// Written by the Controller only, alongside `last_auth_check`.
    logged_in_cached: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        SharedState::default()
    }

    /// Whether the Job Runner should be fetching and running jobs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    /// Whether the worker has been told to shut down for good.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_stopped(&self, value: bool) {
        self.stopped.store(value, Ordering::SeqCst);
    }

    /// The Job Runner's current phase for the active job, if any.
    pub fn phase(&self) -> JobPhase {
        *self.phase.lock().expect("phase mutex poisoned")
    }

    /// Record the Job Runner's current phase.
    pub fn set_phase(&self, phase: JobPhase) {
        *self.phase.lock().expect("phase mutex poisoned") = phase;
    }

    /// The job currently being worked on, if any.
    pub fn job(&self) -> Option<Job> {
        self.job.lock().expect("job mutex poisoned").clone()
    }

    /// Record (or clear) the job currently being worked on.
    pub fn set_job(&self, job: Option<Job>) {
        *self.job.lock().expect("job mutex poisoned") = job;
    }

    /// The id of the job currently being worked on, if any.
    pub fn current_job_id(&self) -> Option<i64> {
        self.job().map(|job| job.job_id)
    }

    /// Whether the heartbeat loop is allowed to ping right now (spec §8
    /// invariant 3: only while `RUNNING ∨ UPLOADING ∨ COMPLETING`).
    pub fn heartbeat_eligible(&self) -> bool {
        self.current_job_id().is_some()
            && matches!(
                self.phase(),
                JobPhase::Running | JobPhase::Uploading | JobPhase::Completing
            )
    }

    fn username(&self) -> Option<String> {
        self.username.lock().expect("username mutex poisoned").clone()
    }

    fn set_username(&self, username: Option<String>) {
        *self.username.lock().expect("username mutex poisoned") = username;
    }

    fn last_auth_check(&self) -> Option<DateTime<Utc>> {
        *self
            .last_auth_check
            .lock()
            .expect("last_auth_check mutex poisoned")
    }

    fn record_auth_check(&self, now: DateTime<Utc>, logged_in: bool) {
        *self
            .last_auth_check
            .lock()
            .expect("last_auth_check mutex poisoned") = Some(now);
        self.logged_in_cached.store(logged_in, Ordering::SeqCst);
    }

    fn logged_in_cached(&self) -> bool {
        self.logged_in_cached.load(Ordering::SeqCst)
    }
}

/// A read-only snapshot of worker state, for the (out-of-tree) UI.
#[derive(Clone, Debug)]
pub struct ControllerSnapshot {
    /// Whether the worker is actively pulling jobs.
    pub running: bool,
    /// Whether the worker has been stopped for good.
    pub stopped: bool,
    /// Whether a job is currently assigned.
    pub has_job: bool,
    /// The current job's type label (`generate_kraus`, `generate_vector`,
    /// `minimize`), if any.
    pub job_type: Option<&'static str>,
    /// The current job's most recently observed iteration.
    pub current_iteration: Option<u64>,
    /// The current job's most recently observed entropy.
    pub current_entropy: Option<f64>,
    /// The last `commands_stored` lines of child stdout.
    pub last_commands: Vec<String>,
    /// When the login state was last confirmed against the server.
    pub last_auth_check: Option<DateTime<Utc>>,
    /// The API Client's advisory status string.
    pub status: String,
    /// The username last used to log in, if any.
    pub username: Option<String>,
}

struct ControllerTasks {
    job_runner: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// Owns every long-lived piece of the worker and exposes the lifecycle
/// surface the UI drives.
pub struct Controller {
    client: Arc<Client>,
    config: WorkerConfig,
    state: Arc<SharedState>,
    ring: TelemetryRing,
    progress: SharedProgress,
    index: Arc<ArtifactIndex>,
    supervisor: Arc<Supervisor>,
    tasks: Mutex<Option<ControllerTasks>>,
}

impl Controller {
    /// Build a controller from `config`, ensuring its directories exist and
    /// that the configured compute binary is present.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.ensure_directories()?;
        let client = Arc::new(Client::new(&config)?);
        let supervisor = Arc::new(Supervisor::new(&config)?);
        let index = Arc::new(ArtifactIndex::load(config.db_path())?);
        let ring = TelemetryRing::new(config.commands_stored);
        let progress = Arc::new(std::sync::Mutex::new(Progress::new()));
        Ok(Controller {
            client,
            config,
            state: Arc::new(SharedState::new()),
            ring,
            progress,
            index,
            supervisor,
            tasks: Mutex::new(None),
        })
    }

    /// Log in, replacing any existing session.
    #[instrument(skip(self, password), level = "debug")]
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.client.login(username, password).await?;
        self.state.set_username(Some(username.to_owned()));
        self.state
            .record_auth_check(Utc::now(), true);
        Ok(())
    }

    /// Check whether we're logged in, using a cached value if it was
    /// confirmed within `ping_interval_secs`.
    #[instrument(skip(self), level = "trace")]
    pub async fn is_logged_in(&self) -> Result<bool> {
        let ping_interval = chrono::Duration::seconds(self.config.ping_interval_secs as i64);
        let fresh = self
            .state
            .last_auth_check()
            .is_some_and(|checked_at| Utc::now() - checked_at < ping_interval);
        if fresh {
            return Ok(self.state.logged_in_cached());
        }
        let logged_in = self.client.ping_auth().await?;
        self.state.record_auth_check(Utc::now(), logged_in);
        Ok(logged_in)
    }

    /// Start (or resume) pulling jobs. Idempotent while already running.
    #[instrument(skip(self), level = "debug")]
    pub fn start(&self) {
        self.state.set_running(true);
        let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");
        if tasks.is_some() {
            return;
        }

        let job_runner = spawn_supervised("job_runner", Arc::clone(&self.state), {
            let client = Arc::clone(&self.client);
            let config = self.config.clone();
            let state = Arc::clone(&self.state);
            let supervisor = Arc::clone(&self.supervisor);
            let ring = self.ring.clone();
            let progress = Arc::clone(&self.progress);
            let index = Arc::clone(&self.index);
            job_runner::run(client, config, state, supervisor, ring, progress, index)
        });
        let heartbeat = spawn_supervised("heartbeat", Arc::clone(&self.state), {
            let client = Arc::clone(&self.client);
            let state = Arc::clone(&self.state);
            let interval = Duration::from_secs(self.config.job_ping_interval_secs);
            heartbeat::run(client, state, interval)
        });

        *tasks = Some(ControllerTasks { job_runner, heartbeat });
    }

    /// Finish any in-flight child, then idle without fetching new jobs.
    #[instrument(skip(self), level = "debug")]
    pub fn pause(&self) {
        self.state.set_running(false);
    }

    /// Stop for good: terminate any running child and let the Job Runner
    /// execute the cancellation path.
    #[instrument(skip(self), level = "debug")]
    pub async fn stop(&self) -> Result<()> {
        self.state.set_running(false);
        self.state.set_stopped(true);
        // Best-effort: there may be no child running right now.
        let _ = self.supervisor.terminate().await;
        Ok(())
    }

    /// A read-only snapshot of worker state, for display.
    pub fn snapshot(&self) -> ControllerSnapshot {
        let job = self.state.job();
        let progress = *self.progress.lock().expect("progress mutex poisoned");
        ControllerSnapshot {
            running: self.state.is_running(),
            stopped: self.state.is_stopped(),
            has_job: job.is_some(),
            job_type: job.as_ref().map(|job| job.kind.type_label()),
            current_iteration: progress.current_iteration,
            current_entropy: progress.current_entropy,
            last_commands: self.ring.snapshot(),
            last_auth_check: self.state.last_auth_check(),
            status: self.client.status(),
            username: self.state.username(),
        }
    }
}

/// Spawn `future` as a supervised background task: a panic is logged and
/// escalated to `state.stopped` instead of silently killing the task.
///
/// Adapted from the teacher's babysitter pattern; unlike a cluster-wide
/// daemon process, this worker shares a process with its UI, so we signal
/// the rest of the worker to stop rather than aborting the whole process.
pub(crate) fn spawn_supervised<F>(name: &'static str, state: Arc<SharedState>, future: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let result = AssertUnwindSafe(future).catch_unwind().await;
        if let Err(err) = result {
            let msg = if let Some(msg) = err.downcast_ref::<&str>() {
                (*msg).to_owned()
            } else if let Some(msg) = err.downcast_ref::<String>() {
                msg.clone()
            } else {
                "an unknown panic occurred".to_owned()
            };
            error!("{name} task panicked, stopping worker: {msg}");
            state.set_stopped(true);
        }
    })
}

#[cfg(test)]
mod tests {
    use moe_common::models::{Job, JobKind};

    use super::*;

    fn sample_job() -> Job {
        Job {
            job_id: 42,
            job_status: "running".to_owned(),
            kind: JobKind::GenerateVector { input_dimension: 16 },
        }
    }

    #[test]
    fn heartbeat_ineligible_with_no_job() {
        let state = SharedState::new();
        state.set_phase(JobPhase::Running);
        assert!(!state.heartbeat_eligible());
    }

    #[test]
    fn heartbeat_ineligible_while_have_job_or_cancelling() {
        let state = SharedState::new();
        state.set_job(Some(sample_job()));
        for phase in [JobPhase::Idle, JobPhase::HaveJob, JobPhase::Cancelling] {
            state.set_phase(phase);
            assert!(!state.heartbeat_eligible(), "{phase:?} should not be eligible");
        }
    }

    #[test]
    fn heartbeat_eligible_while_running_uploading_or_completing() {
        let state = SharedState::new();
        state.set_job(Some(sample_job()));
        for phase in [JobPhase::Running, JobPhase::Uploading, JobPhase::Completing] {
            state.set_phase(phase);
            assert!(state.heartbeat_eligible(), "{phase:?} should be eligible");
        }
    }

    #[test]
    fn stopped_flag_is_sticky_once_set() {
        let state = SharedState::new();
        assert!(!state.is_stopped());
        state.set_stopped(true);
        assert!(state.is_stopped());
    }

    #[test]
    fn job_round_trips_through_shared_state() {
        let state = SharedState::new();
        assert_eq!(state.current_job_id(), None);
        state.set_job(Some(sample_job()));
        assert_eq!(state.current_job_id(), Some(42));
        state.set_job(None);
        assert_eq!(state.current_job_id(), None);
    }

    #[test]
    fn auth_check_records_a_wall_clock_timestamp() {
        let state = SharedState::new();
        assert_eq!(state.last_auth_check(), None);
        let checked_at = Utc::now();
        state.record_auth_check(checked_at, true);
        assert_eq!(state.last_auth_check(), Some(checked_at));
        assert!(state.logged_in_cached());
    }
}
