//! Drives one job end-to-end: fetch, input acquisition, execution, upload
//! and completion, with cancellation handling (C6).

use std::{sync::Arc, time::Duration};

use moe_common::{
    artifact_index::{ArtifactIndex, FileKind},
    prelude::*,
    rest_api::Client,
    telemetry::TelemetryRing,
};
use tokio::sync::mpsc;

use crate::{
    controller::{JobPhase, SharedState},
    parser::SharedProgress,
    process::{SingleshotOptions, SpawnedOutput, Supervisor},
};

/// Run the Job Runner main loop until `state` is stopped.
#[instrument(skip_all, level = "trace")]
pub async fn run(
    client: Arc<Client>,
    config: WorkerConfig,
    state: Arc<SharedState>,
    supervisor: Arc<Supervisor>,
    ring: TelemetryRing,
    progress: SharedProgress,
    index: Arc<ArtifactIndex>,
) {
    loop {
        if state.is_stopped() {
            return;
        }
        if !state.is_running() {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        match client.get_job().await {
            Ok(Some(job)) => {
                info!("fetched job {} ({})", job.job_id, job.kind.output_file_type());
                state.set_job(Some(job.clone()));
                state.set_phase(JobPhase::HaveJob);
                *progress.lock().expect("progress mutex poisoned") = Progress::new();

                let result = run_job(
                    &client,
                    &config,
                    &state,
                    &supervisor,
                    &ring,
                    &progress,
                    &index,
                    &job,
                )
                .await;
                report_outcome(&job, result);

                state.set_phase(JobPhase::Idle);
                state.set_job(None);
            }
            Ok(None) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => {
                warn!("error fetching job: {err:#}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn report_outcome(job: &Job, result: Result<()>) {
    if let Err(err) = result {
        match err.downcast_ref::<WorkerError>() {
            Some(WorkerError::Cancelled) => info!("job {} cancelled", job.job_id),
            _ => error!("job {} failed: {err:#}", job.job_id),
        }
    } else {
        info!("job {} completed", job.job_id);
    }
}

/// Drive a single job through acquisition, execution, and upload, handling
/// a mid-run cancellation request.
async fn run_job(
    client: &Arc<Client>,
    config: &WorkerConfig,
    state: &Arc<SharedState>,
    supervisor: &Arc<Supervisor>,
    ring: &TelemetryRing,
    progress: &SharedProgress,
    index: &Arc<ArtifactIndex>,
    job: &Job,
) -> Result<()> {
    let (vector_path, kraus_path) = acquire_inputs(client, config, index, job).await?;

    state.set_phase(JobPhase::Running);
    let out_path = config.out_folder().join(format!("{}_out.dat", job.job_id));
    let spawned = spawn_for(
        supervisor,
        job,
        &out_path,
        vector_path.as_deref(),
        kraus_path.as_deref(),
    )
    .await?;

    let watcher = tokio::spawn(watch_for_cancellation(
        Arc::clone(supervisor),
        Arc::clone(state),
    ));
    let stderr_drain = tokio::spawn(drain_stderr(spawned.stderr));
    let parser_task = tokio::spawn(crate::parser::run(spawned.stdout, ring.clone(), progress.clone()));

    parser_task.await.context("parser task panicked")?;
    stderr_drain.await.context("stderr drain task panicked")?;
    let exit = supervisor.await_exit().await?;
    watcher.abort();

    if state.is_stopped() {
        if matches!(job.kind, JobKind::Minimize { .. }) {
            state.set_phase(JobPhase::Cancelling);
            return cancellation_flush(client, index, progress, job, &out_path).await;
        }
        return Err(WorkerError::Cancelled.into());
    }

    if !exit.ok {
        return Err(WorkerError::Process(exit.err.unwrap_or(exit.stdout_summary)).into());
    }

    index.record_output(job.job_id, file_kind_for(&job.kind), out_path.clone())?;

    state.set_phase(JobPhase::Uploading);
    upload_and_complete(client, job, progress, &out_path).await?;
    state.set_phase(JobPhase::Completing);
    Ok(())
}

/// Download the input artifacts a `minimize` job needs; a no-op for
/// generation jobs.
async fn acquire_inputs(
    client: &Client,
    config: &WorkerConfig,
    index: &ArtifactIndex,
    job: &Job,
) -> Result<(Option<std::path::PathBuf>, Option<std::path::PathBuf>)> {
    match &job.kind {
        JobKind::Minimize {
            kraus_file_id,
            vector_file_id,
        } => {
            let vector_path =
                download_input(client, config, index, vector_file_id, FileKind::Vector).await?;
            let kraus_path =
                download_input(client, config, index, kraus_file_id, FileKind::Kraus).await?;
            Ok((Some(vector_path), Some(kraus_path)))
        }
        JobKind::GenerateKraus { .. } | JobKind::GenerateVector { .. } => Ok((None, None)),
    }
}

async fn download_input(
    client: &Client,
    config: &WorkerConfig,
    index: &ArtifactIndex,
    file_id: &str,
    kind: FileKind,
) -> Result<std::path::PathBuf> {
    let local_path = config.in_folder().join(format!("{file_id}_in.dat"));
    let link = client.request_download_link(file_id).await?;
    client.download_file(&link, &local_path).await?;
    index.record_input(file_id, kind, local_path.clone())?;
    Ok(local_path)
}

async fn spawn_for(
    supervisor: &Supervisor,
    job: &Job,
    out_path: &Path,
    vector_path: Option<&Path>,
    kraus_path: Option<&Path>,
) -> Result<SpawnedOutput> {
    match &job.kind {
        JobKind::GenerateKraus {
            number_kraus,
            input_dimension,
            ..
        } => supervisor.spawn_kraus(*number_kraus, *input_dimension, out_path).await,
        JobKind::GenerateVector { input_dimension } => {
            supervisor.spawn_vector(*input_dimension, out_path).await
        }
        JobKind::Minimize { .. } => {
            let vector_path =
                vector_path.ok_or_else(|| format_err!("missing vector path for minimize job"))?;
            let kraus_path =
                kraus_path.ok_or_else(|| format_err!("missing kraus path for minimize job"))?;
            supervisor
                .spawn_singleshot(out_path, vector_path, kraus_path, &SingleshotOptions::default())
                .await
        }
    }
}

fn file_kind_for(kind: &JobKind) -> FileKind {
    match kind.output_file_type() {
        "kraus" => FileKind::Kraus,
        _ => FileKind::Vector,
    }
}

/// Request an upload link, upload the recorded output, push any observed
/// progress for `minimize` jobs, and mark the job complete.
async fn upload_and_complete(
    client: &Client,
    job: &Job,
    progress: &SharedProgress,
    out_path: &Path,
) -> Result<()> {
    let upload_link = client.request_upload_link().await?;
    client
        .upload_file(job.job_id, job.kind.output_file_type(), out_path, &upload_link)
        .await?;

    if matches!(job.kind, JobKind::Minimize { .. }) {
        let snapshot = *progress.lock().expect("progress mutex poisoned");
        if let Some(iteration) = snapshot.current_iteration {
            client.update_iterations(job.job_id, iteration).await?;
        }
        if let Some(entropy) = snapshot.current_entropy {
            client.update_entropy(job.job_id, entropy).await?;
        }
    }

    client.complete_job(job.job_id).await?;
    Ok(())
}

/// Upload whatever partial output exists, push observed progress, and tell
/// the server to reassign the job, rather than completing it.
async fn cancellation_flush(
    client: &Client,
    index: &ArtifactIndex,
    progress: &SharedProgress,
    job: &Job,
    out_path: &Path,
) -> Result<()> {
    if out_path.exists() {
        index.record_output(job.job_id, FileKind::Vector, out_path.to_path_buf())?;
        let upload_link = client.request_upload_link().await?;
        client.upload_file(job.job_id, "vector", out_path, &upload_link).await?;
    }

    let snapshot = *progress.lock().expect("progress mutex poisoned");
    if let Some(iteration) = snapshot.current_iteration {
        client.update_iterations(job.job_id, iteration).await?;
    }
    if let Some(entropy) = snapshot.current_entropy {
        client.update_entropy(job.job_id, entropy).await?;
    }

    client.cancel_job(job.job_id).await?;
    Err(WorkerError::Cancelled.into())
}

async fn drain_stderr(mut stderr: mpsc::Receiver<String>) {
    while let Some(line) = stderr.recv().await {
        debug!("child stderr: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_kind_matches_output_file_type() {
        assert_eq!(
            file_kind_for(&JobKind::GenerateKraus {
                channel_id: 1,
                number_kraus: 4,
                input_dimension: 8,
            }),
            FileKind::Kraus,
        );
        assert_eq!(
            file_kind_for(&JobKind::GenerateVector { input_dimension: 8 }),
            FileKind::Vector,
        );
        assert_eq!(
            file_kind_for(&JobKind::Minimize {
                kraus_file_id: "K".to_owned(),
                vector_file_id: "V".to_owned(),
            }),
            FileKind::Vector,
        );
    }

    #[tokio::test]
    async fn stderr_drain_stops_once_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send("a fault occurred".to_owned()).await.unwrap();
        drop(tx);
        // Should return promptly once the sender is dropped, never hang.
        tokio::time::timeout(Duration::from_millis(200), drain_stderr(rx))
            .await
            .expect("drain_stderr did not stop after channel closed");
    }
}

/// Poll `state` for a stop request and terminate the running child as soon
/// as one arrives. Aborted by the caller once the child has already exited
/// on its own.
async fn watch_for_cancellation(supervisor: Arc<Supervisor>, state: Arc<SharedState>) {
    loop {
        if state.is_stopped() {
            if let Err(err) = supervisor.terminate().await {
                warn!("error terminating child on cancellation: {err:#}");
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
