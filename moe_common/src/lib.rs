//! Code shared between the worker binary and its tests: configuration, the
//! job-server REST client, the on-disk artifact index, and the telemetry
//! ring that the (out-of-tree) UI reads.

#![warn(missing_docs)]

pub mod artifact_index;
pub mod config;
pub mod errors;
pub mod models;
pub mod rest_api;
pub mod telemetry;
pub mod tracing_support;

pub use reqwest;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;

/// Common imports used by many modules.
pub mod prelude {
    pub use std::{
        fmt,
        path::{Path, PathBuf},
    };

    pub use anyhow::{format_err, Context};
    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use crate::{config::WorkerConfig, errors::WorkerError, models::*, Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;
/// Result type for this crate's functions.
pub use anyhow::Result;
