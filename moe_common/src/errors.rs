//! Typed error kinds, carried inside [`anyhow::Error`].
//!
//! Most call sites just propagate errors with `?` and a `.context(...)`
//! string, the way the rest of this crate does. `WorkerError` exists so that
//! a caller which needs to branch on error *kind* (the Job Runner deciding
//! whether a failure is a cancellation versus a hard failure, for example)
//! can `err.downcast_ref::<WorkerError>()` instead of matching on message
//! text.

use std::fmt;

/// The classification of errors from spec §7.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerError {
    /// Invalid credentials, or a refresh that failed.
    Auth(String),
    /// A network error, or a non-2xx response from the job server.
    Transport(String),
    /// A local file or the artifact index could not be read or written.
    Storage(String),
    /// The compute binary was missing, failed to spawn, or exited non-zero.
    Process(String),
    /// The job server returned something we couldn't make sense of.
    Protocol(String),
    /// The current job was cancelled by the controller.
    Cancelled,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Auth(msg) => write!(f, "authentication error: {msg}"),
            WorkerError::Transport(msg) => write!(f, "transport error: {msg}"),
            WorkerError::Storage(msg) => write!(f, "storage error: {msg}"),
            WorkerError::Process(msg) => write!(f, "process error: {msg}"),
            WorkerError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            WorkerError::Cancelled => write!(f, "job was cancelled"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl WorkerError {
    /// Is this a cancellation, as opposed to a genuine failure?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }
}

#[test]
fn display_includes_kind_and_message() {
    let err = WorkerError::Transport("connection refused".to_owned());
    assert_eq!(err.to_string(), "transport error: connection refused");
    assert!(!err.is_cancelled());
    assert!(WorkerError::Cancelled.is_cancelled());
}
