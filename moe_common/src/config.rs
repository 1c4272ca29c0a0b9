//! Worker configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// All tunables recognized by the worker, with the defaults from the
/// original `WorkerConfig` dataclass.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base URL of the job server.
    pub api_url: String,
    /// Directory under which `in_subfolder`, `out_subfolder`, and `db` live.
    pub data_folder: PathBuf,
    /// Subdirectory of `data_folder` holding downloaded input artifacts.
    pub in_subfolder: String,
    /// Subdirectory of `data_folder` holding produced output artifacts.
    pub out_subfolder: String,
    /// Filename (relative to `data_folder`) of the artifact index document.
    pub db: String,
    /// Number of trailing stdout lines retained by the telemetry ring.
    pub commands_stored: usize,
    /// How often (seconds) a cached login check is revalidated against the
    /// server.
    pub ping_interval_secs: u64,
    /// How often (seconds) the heartbeat loop pings the active job.
    pub job_ping_interval_secs: u64,
    /// Chunk size (bytes) used when streaming a download to disk.
    pub chunk_size: u64,
    /// Largest file size (bytes) uploaded as a single request before the
    /// client switches to chunked upload.
    pub max_request_size: u64,
    /// Path to the native compute binary.
    pub executable_path: PathBuf,
    /// Whether the compute binary should print non-progress output
    /// (`!printing` maps to the `-s` "silent" flag).
    pub printing: bool,
    /// Whether the compute binary should pass `-l` ("log").
    pub logging: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            api_url: "http://localhost:8000".to_owned(),
            data_folder: PathBuf::from("./data"),
            in_subfolder: "input".to_owned(),
            out_subfolder: "output".to_owned(),
            db: "moe.json".to_owned(),
            commands_stored: 10,
            ping_interval_secs: 10,
            job_ping_interval_secs: 30,
            chunk_size: 1024 * 1024,
            max_request_size: 50 * 1024 * 1024,
            executable_path: PathBuf::from("./bin/moe"),
            printing: true,
            logging: false,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file, falling back to the defaults for
    /// any key it doesn't specify.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        let config: WorkerConfig = toml::from_str(&text)
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        Ok(config)
    }

    /// The directory holding downloaded input artifacts.
    pub fn in_folder(&self) -> PathBuf {
        self.data_folder.join(&self.in_subfolder)
    }

    /// The directory holding produced output artifacts.
    pub fn out_folder(&self) -> PathBuf {
        self.data_folder.join(&self.out_subfolder)
    }

    /// The full path to the artifact index document.
    pub fn db_path(&self) -> PathBuf {
        self.data_folder.join(&self.db)
    }

    /// Create `data_folder`, `in_folder()`, and `out_folder()` if they don't
    /// already exist.
    pub fn ensure_directories(&self) -> Result<()> {
        use anyhow::Context;
        std::fs::create_dir_all(&self.data_folder)
            .with_context(|| format!("cannot create {}", self.data_folder.display()))?;
        std::fs::create_dir_all(self.in_folder())
            .with_context(|| format!("cannot create {}", self.in_folder().display()))?;
        std::fs::create_dir_all(self.out_folder())
            .with_context(|| format!("cannot create {}", self.out_folder().display()))?;
        Ok(())
    }
}

#[test]
fn default_config_matches_spec() {
    let config = WorkerConfig::default();
    assert_eq!(config.api_url, "http://localhost:8000");
    assert_eq!(config.commands_stored, 10);
    assert_eq!(config.ping_interval_secs, 10);
    assert_eq!(config.job_ping_interval_secs, 30);
    assert_eq!(config.chunk_size, 1024 * 1024);
    assert_eq!(config.max_request_size, 50 * 1024 * 1024);
}

#[test]
fn folders_nest_under_data_folder() {
    let config = WorkerConfig::default();
    assert_eq!(config.in_folder(), Path::new("./data/input"));
    assert_eq!(config.out_folder(), Path::new("./data/output"));
    assert_eq!(config.db_path(), Path::new("./data/moe.json"));
}
