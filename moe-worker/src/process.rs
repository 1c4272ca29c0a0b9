//! Spawns, observes, and terminates the native compute binary (C3).

use std::{path::Path, process::Stdio};

use moe_common::prelude::*;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

/// Optional flags accepted by `singleshot`, beyond the bare vector/kraus/
/// output triple. The Job Runner never sets any of these today (see
/// DESIGN.md), but the Supervisor exposes the full flag surface so a future
/// job payload can carry them without changing this module.
#[derive(Clone, Debug, Default)]
pub struct SingleshotOptions {
    /// Target entropy to predict towards. Only emitted as `-p -t <e>` when
    /// `Some(e)` with `e > 0.0`.
    pub target_entropy: Option<f64>,
    /// Iteration cap, emitted as `-i <n>` when `Some(n)` with `n > 0`.
    pub iterations: Option<u32>,
    /// Checkpointing configuration, emitted as `-c [-cf <path>] [-ci <n>]`.
    pub checkpoint: Option<Checkpoint>,
}

/// Checkpoint flags for a `singleshot` run.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    /// `-cf <path>`, omitted if `None`.
    pub path: Option<String>,
    /// `-ci <n>`, omitted if `None` or zero.
    pub interval: Option<u32>,
}

/// The two bounded output channels produced by [`Supervisor::spawn_vector`]
/// and friends.
///
/// Each receiver's underlying sender is dropped once the reader task hits
/// EOF on the corresponding pipe — that channel closure *is* the end-of-
/// stream sentinel; there is no separate marker value.
pub struct SpawnedOutput {
    /// Lines read from the child's stdout, in source order.
    pub stdout: mpsc::Receiver<String>,
    /// Lines read from the child's stderr. No ordering guarantee relative
    /// to stdout.
    pub stderr: mpsc::Receiver<String>,
}

/// The result of awaiting a child's exit.
#[derive(Debug)]
pub struct ExitReport {
    /// `true` iff the child exited with status 0.
    pub ok: bool,
    /// A one-line summary of the exit status, for logging.
    pub stdout_summary: String,
    /// The exit failure detail, if `!ok`.
    pub err: Option<String>,
}

struct RunningChild {
    child: Child,
    stdout_reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
}

/// Owns the compute binary's location and flag configuration, and
/// supervises at most one running child at a time.
pub struct Supervisor {
    executable_path: std::path::PathBuf,
    printing: bool,
    logging: bool,
    running: Mutex<Option<RunningChild>>,
}

impl Supervisor {
    /// Check that the configured binary exists, then construct a supervisor
    /// for it.
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        if !config.executable_path.exists() {
            return Err(WorkerError::Process(format!(
                "executable not found: {}",
                config.executable_path.display()
            ))
            .into());
        }
        Ok(Supervisor {
            executable_path: config.executable_path.clone(),
            printing: config.printing,
            logging: config.logging,
            running: Mutex::new(None),
        })
    }

    /// `<bin> vector -N <n> -o <out>`
    #[instrument(skip(self), level = "debug")]
    pub async fn spawn_vector(&self, n: u32, out: &Path) -> Result<SpawnedOutput> {
        let args = build_vector_args(n, out, self.printing, self.logging);
        self.spawn(args).await
    }

    /// `<bin> kraus haar -d <d> -N <n> -o <out>`
    #[instrument(skip(self), level = "debug")]
    pub async fn spawn_kraus(&self, d: u32, n: u32, out: &Path) -> Result<SpawnedOutput> {
        let args = build_kraus_args(d, n, out, self.printing, self.logging);
        self.spawn(args).await
    }

    /// `<bin> singleshot -v <vector> -k <kraus> -S -o <out>` plus any
    /// optional flags from `options`.
    #[instrument(skip(self), level = "debug")]
    pub async fn spawn_singleshot(
        &self,
        out: &Path,
        vector: &Path,
        kraus: &Path,
        options: &SingleshotOptions,
    ) -> Result<SpawnedOutput> {
        let args = build_singleshot_args(out, vector, kraus, options, self.printing, self.logging);
        self.spawn(args).await
    }

    /// Send a termination request to the running child and return
    /// immediately; the caller must still call [`Supervisor::await_exit`].
    #[instrument(skip(self), level = "debug")]
    pub async fn terminate(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(running_child) = running.as_mut() {
            // `tokio::process::Child` has no portable graceful-stop API; this
            // is the closest we get without pulling in a signal-handling
            // crate for a single kill call.
            running_child
                .child
                .start_kill()
                .context("could not signal child to terminate")?;
        }
        Ok(())
    }

    /// Wait for the running child to exit, and for both pipe readers to
    /// drain to EOF, then return its exit report.
    #[instrument(skip(self), level = "debug")]
    pub async fn await_exit(&self) -> Result<ExitReport> {
        let mut running = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| WorkerError::Process("no child is running".to_owned()))?;

        let status = running
            .child
            .wait()
            .await
            .context("error waiting for child to exit")?;

        running
            .stdout_reader
            .await
            .context("stdout reader task panicked")?;
        running
            .stderr_reader
            .await
            .context("stderr reader task panicked")?;

        if status.success() {
            Ok(ExitReport {
                ok: true,
                stdout_summary: "process completed successfully".to_owned(),
                err: None,
            })
        } else {
            let message = format!("process failed with status {status}");
            Ok(ExitReport {
                ok: false,
                stdout_summary: message.clone(),
                err: Some(message),
            })
        }
    }

    async fn spawn(&self, args: Vec<String>) -> Result<SpawnedOutput> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return Err(WorkerError::Process(
                "a child is already running; at most one may be live".to_owned(),
            )
            .into());
        }

        let mut child = Command::new(&self.executable_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not spawn {}", self.executable_path.display()))?;

        let stdout = child.stdout.take().expect("child spawned with piped stdout");
        let stderr = child.stderr.take().expect("child spawned with piped stderr");

        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);

        let stdout_reader = tokio::spawn(read_lines(stdout, stdout_tx));
        let stderr_reader = tokio::spawn(read_lines(stderr, stderr_tx));

        *guard = Some(RunningChild {
            child,
            stdout_reader,
            stderr_reader,
        });

        Ok(SpawnedOutput {
            stdout: stdout_rx,
            stderr: stderr_rx,
        })
    }
}

/// Read lines from `pipe` until EOF, pushing each (UTF-8 decoded, trailing
/// whitespace stripped) onto `tx`. Closing `tx` on return is what signals
/// end-of-stream to the consumer.
async fn read_lines<R: tokio::io::AsyncRead + Unpin>(pipe: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line.trim_end().to_owned()).await.is_err() {
                    // Receiver dropped; keep draining the pipe so the child
                    // is never blocked on a full OS pipe buffer.
                    continue;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!("error reading child output: {err}");
                return;
            }
        }
    }
}

fn common_flags(printing: bool, logging: bool) -> Vec<String> {
    let mut flags = Vec::new();
    if !printing {
        flags.push("-s".to_owned());
    }
    if logging {
        flags.push("-l".to_owned());
    }
    flags
}

fn build_vector_args(n: u32, out: &Path, printing: bool, logging: bool) -> Vec<String> {
    let mut args = vec![
        "vector".to_owned(),
        "-N".to_owned(),
        n.to_string(),
        "-o".to_owned(),
        out.display().to_string(),
    ];
    args.extend(common_flags(printing, logging));
    args
}

fn build_kraus_args(d: u32, n: u32, out: &Path, printing: bool, logging: bool) -> Vec<String> {
    let mut args = vec![
        "kraus".to_owned(),
        "haar".to_owned(),
        "-d".to_owned(),
        d.to_string(),
        "-N".to_owned(),
        n.to_string(),
        "-o".to_owned(),
        out.display().to_string(),
    ];
    args.extend(common_flags(printing, logging));
    args
}

fn build_singleshot_args(
    out: &Path,
    vector: &Path,
    kraus: &Path,
    options: &SingleshotOptions,
    printing: bool,
    logging: bool,
) -> Vec<String> {
    let mut args = vec![
        "singleshot".to_owned(),
        "-v".to_owned(),
        vector.display().to_string(),
        "-k".to_owned(),
        kraus.display().to_string(),
        "-S".to_owned(),
        "-o".to_owned(),
        out.display().to_string(),
    ];
    if let Some(target_entropy) = options.target_entropy {
        if target_entropy > 0.0 {
            args.push("-p".to_owned());
            args.push("-t".to_owned());
            args.push(target_entropy.to_string());
        }
    }
    if let Some(iterations) = options.iterations {
        if iterations > 0 {
            args.push("-i".to_owned());
            args.push(iterations.to_string());
        }
    }
    if let Some(checkpoint) = &options.checkpoint {
        args.push("-c".to_owned());
        if let Some(path) = &checkpoint.path {
            args.push("-cf".to_owned());
            args.push(path.clone());
        }
        if let Some(interval) = checkpoint.interval {
            if interval > 0 {
                args.push("-ci".to_owned());
                args.push(interval.to_string());
            }
        }
    }
    args.extend(common_flags(printing, logging));
    args
}

#[test]
fn vector_command_matches_table() {
    let args = build_vector_args(64, Path::new("/data/output/21_out.dat"), true, false);
    assert_eq!(
        args,
        vec!["vector", "-N", "64", "-o", "/data/output/21_out.dat"]
    );
}

#[test]
fn kraus_command_matches_table() {
    let args = build_kraus_args(100, 10, Path::new("/data/output/14_out.dat"), true, false);
    assert_eq!(
        args,
        vec![
            "kraus", "haar", "-d", "100", "-N", "10", "-o", "/data/output/14_out.dat"
        ]
    );
}

#[test]
fn singleshot_bare_triple_has_no_optional_flags() {
    let args = build_singleshot_args(
        Path::new("/data/output/30_out.dat"),
        Path::new("/data/input/V_in.dat"),
        Path::new("/data/input/K_in.dat"),
        &SingleshotOptions::default(),
        true,
        false,
    );
    assert_eq!(
        args,
        vec![
            "singleshot",
            "-v",
            "/data/input/V_in.dat",
            "-k",
            "/data/input/K_in.dat",
            "-S",
            "-o",
            "/data/output/30_out.dat",
        ]
    );
}

#[test]
fn singleshot_full_flag_surface() {
    let options = SingleshotOptions {
        target_entropy: Some(0.5),
        iterations: Some(200),
        checkpoint: Some(Checkpoint {
            path: Some("./checkpoint.dat".to_owned()),
            interval: Some(50),
        }),
    };
    let args = build_singleshot_args(
        Path::new("/out.dat"),
        Path::new("/v.dat"),
        Path::new("/k.dat"),
        &options,
        false,
        true,
    );
    assert_eq!(
        args,
        vec![
            "singleshot",
            "-v",
            "/v.dat",
            "-k",
            "/k.dat",
            "-S",
            "-o",
            "/out.dat",
            "-p",
            "-t",
            "0.5",
            "-i",
            "200",
            "-c",
            "-cf",
            "./checkpoint.dat",
            "-ci",
            "50",
            "-s",
            "-l",
        ]
    );
}

#[test]
fn silent_flag_only_emitted_when_not_printing() {
    let args = build_vector_args(1, Path::new("/o"), false, false);
    assert!(args.iter().any(|a| a == "-s"));
    let args = build_vector_args(1, Path::new("/o"), true, false);
    assert!(!args.iter().any(|a| a == "-s"));
}
