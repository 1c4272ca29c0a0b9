//! On-disk mapping of file-id → local path (inputs) and job-id → local
//! path (outputs) (C1).

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{errors::WorkerError, Result};

/// Which kind of artifact a recorded file is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// A Kraus operator artifact.
    Kraus,
    /// A state vector artifact.
    Vector,
}

/// A single recorded artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    /// The kind of artifact this is.
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Its local path on disk.
    pub path: PathBuf,
}

/// The JSON document persisted at `<data_folder>/<db>`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    in_files: HashMap<String, FileEntry>,
    #[serde(default)]
    out_files: HashMap<String, FileEntry>,
}

/// The on-disk artifact index.
///
/// Every mutation serializes the entire document and atomically replaces
/// the file on disk (write-to-temp, then rename), so a crash mid-write
/// never leaves a partially-written index behind. Only ever mutated from
/// the Job Runner task (spec §5).
pub struct ArtifactIndex {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl ArtifactIndex {
    /// Load the index from `path`, or start with an empty one if the file
    /// doesn't exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| {
                WorkerError::Storage(format!(
                    "could not read artifact index {}: {e}",
                    path.display()
                ))
            })?;
            serde_json::from_str(&text).map_err(|e| {
                WorkerError::Storage(format!(
                    "could not parse artifact index {}: {e}",
                    path.display()
                ))
            })?
        } else {
            Document::default()
        };
        Ok(ArtifactIndex {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Record (or overwrite) the local path for a downloaded input file.
    pub fn record_input(&self, file_id: &str, kind: FileKind, path: PathBuf) -> Result<()> {
        let mut doc = self.doc.lock().expect("artifact index mutex poisoned");
        doc.in_files
            .insert(file_id.to_owned(), FileEntry { kind, path });
        self.persist(&doc)
    }

    /// Record (or overwrite) the local path for a job's produced output file.
    pub fn record_output(&self, job_id: i64, kind: FileKind, path: PathBuf) -> Result<()> {
        let mut doc = self.doc.lock().expect("artifact index mutex poisoned");
        doc.out_files
            .insert(job_id.to_string(), FileEntry { kind, path });
        self.persist(&doc)
    }

    /// Look up a previously recorded input file's local path.
    pub fn lookup_input(&self, file_id: &str) -> Option<FileEntry> {
        let doc = self.doc.lock().expect("artifact index mutex poisoned");
        doc.in_files.get(file_id).cloned()
    }

    /// Look up a previously recorded output file's local path.
    pub fn lookup_output(&self, job_id: i64) -> Option<FileEntry> {
        let doc = self.doc.lock().expect("artifact index mutex poisoned");
        doc.out_files.get(&job_id.to_string()).cloned()
    }

    /// Serialize `doc` and atomically replace the file at `self.path`.
    fn persist(&self, doc: &Document) -> Result<()> {
        let text = serde_json::to_string(doc)
            .map_err(|e| WorkerError::Storage(format!("could not serialize artifact index: {e}")))?;
        let tmp_path = tmp_path_for(&self.path);
        fs::write(&tmp_path, text).map_err(|e| {
            WorkerError::Storage(format!(
                "could not write artifact index {}: {e}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            WorkerError::Storage(format!(
                "could not replace artifact index {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}

/// Build the temp-file path used for atomic replacement of `path`.
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[test]
fn round_trip_preserves_the_logical_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("moe.json");

    let index = ArtifactIndex::load(&db_path).unwrap();
    index
        .record_input("K", FileKind::Kraus, PathBuf::from("/data/input/K_in.dat"))
        .unwrap();
    index
        .record_output(14, FileKind::Kraus, PathBuf::from("/data/output/14_out.dat"))
        .unwrap();

    let reloaded = ArtifactIndex::load(&db_path).unwrap();
    let input = reloaded.lookup_input("K").unwrap();
    assert_eq!(input.kind, FileKind::Kraus);
    assert_eq!(input.path, PathBuf::from("/data/input/K_in.dat"));

    let output = reloaded.lookup_output(14).unwrap();
    assert_eq!(output.kind, FileKind::Kraus);
    assert_eq!(output.path, PathBuf::from("/data/output/14_out.dat"));
}

#[test]
fn duplicate_inserts_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let index = ArtifactIndex::load(dir.path().join("moe.json")).unwrap();
    index
        .record_output(1, FileKind::Vector, PathBuf::from("/a"))
        .unwrap();
    index
        .record_output(1, FileKind::Vector, PathBuf::from("/b"))
        .unwrap();
    assert_eq!(
        index.lookup_output(1).unwrap().path,
        PathBuf::from("/b")
    );
}

#[test]
fn missing_file_has_no_entry() {
    let dir = tempfile::tempdir().unwrap();
    let index = ArtifactIndex::load(dir.path().join("moe.json")).unwrap();
    assert!(index.lookup_input("nope").is_none());
    assert!(index.lookup_output(999).is_none());
}
