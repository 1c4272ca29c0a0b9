//! The `Job` the worker fetches from the job server, and the typed
//! `JobKind` dispatch tag (spec §9 design note: "replace string-switching
//! with a tagged variant").

use serde::{Deserialize, Serialize};

use crate::{errors::WorkerError, Result};

/// The job-type-specific payload carried by a fetched job.
///
/// Each variant only carries the fields that job type actually uses —
/// unlike the source system's flat struct with every field optional
/// regardless of `job_type`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    /// Generate a fresh set of Kraus operators for a channel.
    GenerateKraus {
        /// The channel these operators belong to.
        channel_id: i64,
        /// How many Kraus operators to generate.
        number_kraus: u32,
        /// The input (and output) Hilbert space dimension.
        input_dimension: u32,
    },
    /// Generate a fresh random state vector.
    GenerateVector {
        /// The Hilbert space dimension of the vector.
        input_dimension: u32,
    },
    /// Run a single-shot minimization of the channel's output entropy.
    Minimize {
        /// File id of the Kraus operator artifact to download.
        kraus_file_id: String,
        /// File id of the state vector artifact to download.
        vector_file_id: String,
    },
}

impl JobKind {
    /// The `file_type` tag used when uploading this job's output artifact.
    pub fn output_file_type(&self) -> &'static str {
        match self {
            JobKind::GenerateKraus { .. } => "kraus",
            JobKind::GenerateVector { .. } => "vector",
            JobKind::Minimize { .. } => "vector",
        }
    }

    /// The `job_type` literal this variant was parsed from, for display.
    pub fn type_label(&self) -> &'static str {
        match self {
            JobKind::GenerateKraus { .. } => "generate_kraus",
            JobKind::GenerateVector { .. } => "generate_vector",
            JobKind::Minimize { .. } => "minimize",
        }
    }
}

/// The raw shape returned by `GET /jobs/request`, before we've validated it
/// into a [`Job`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobResponse {
    /// The job's numeric id.
    pub job_id: i64,
    /// One of `generate_kraus`, `generate_vector`, `minimize`.
    pub job_type: String,
    /// The job's status as the server understands it, advisory only.
    pub job_status: String,
    /// File id of an existing Kraus operator artifact, if any.
    pub kraus_id: Option<String>,
    /// File id of an existing state vector artifact, if any.
    pub vector_id: Option<String>,
    /// Job-type-specific fields.
    #[serde(default)]
    pub job_data: Option<JobDataResponse>,
}

/// The `job_data` sub-object of [`JobResponse`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JobDataResponse {
    /// The channel a generation job belongs to.
    pub channel_id: Option<i64>,
    /// How many Kraus operators to generate.
    pub number_kraus: Option<u32>,
    /// The Hilbert space dimension.
    pub input_dimension: Option<u32>,
    /// The output dimension, present for Kraus generation.
    pub output_dimension: Option<u32>,
}

/// An immutable job description, validated into a typed [`JobKind`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    /// The job's numeric id.
    pub job_id: i64,
    /// The job's status as last reported by the server, advisory only.
    pub job_status: String,
    /// The job-type-specific payload.
    pub kind: JobKind,
}

impl Job {
    /// Validate a raw server response into a typed `Job`.
    ///
    /// Returns a [`WorkerError::Protocol`] if the `job_type` is unrecognized
    /// or a job type is missing fields it requires.
    pub fn from_response(resp: JobResponse) -> Result<Job> {
        let data = resp.job_data.unwrap_or_default();
        let kind = match resp.job_type.as_str() {
            "generate_kraus" => JobKind::GenerateKraus {
                channel_id: data.channel_id.ok_or_else(|| {
                    WorkerError::Protocol(
                        "generate_kraus job is missing job_data.channel_id".to_owned(),
                    )
                })?,
                number_kraus: data.number_kraus.ok_or_else(|| {
                    WorkerError::Protocol(
                        "generate_kraus job is missing job_data.number_kraus".to_owned(),
                    )
                })?,
                input_dimension: data.input_dimension.ok_or_else(|| {
                    WorkerError::Protocol(
                        "generate_kraus job is missing job_data.input_dimension".to_owned(),
                    )
                })?,
            },
            "generate_vector" => JobKind::GenerateVector {
                input_dimension: data.input_dimension.ok_or_else(|| {
                    WorkerError::Protocol(
                        "generate_vector job is missing job_data.input_dimension".to_owned(),
                    )
                })?,
            },
            "minimize" => JobKind::Minimize {
                kraus_file_id: resp.kraus_id.ok_or_else(|| {
                    WorkerError::Protocol("minimize job is missing kraus_id".to_owned())
                })?,
                vector_file_id: resp.vector_id.ok_or_else(|| {
                    WorkerError::Protocol("minimize job is missing vector_id".to_owned())
                })?,
            },
            other => {
                return Err(WorkerError::Protocol(format!("unknown job_type: {other}")).into());
            }
        };
        Ok(Job {
            job_id: resp.job_id,
            job_status: resp.job_status,
            kind,
        })
    }
}

#[test]
fn minimize_requires_both_file_ids() {
    let resp = JobResponse {
        job_id: 30,
        job_type: "minimize".to_owned(),
        job_status: "running".to_owned(),
        kraus_id: Some("K".to_owned()),
        vector_id: None,
        job_data: None,
    };
    let err = Job::from_response(resp).unwrap_err();
    assert!(err.to_string().contains("vector_id"));
}

#[test]
fn generate_kraus_dispatches_correctly() {
    let resp = JobResponse {
        job_id: 14,
        job_type: "generate_kraus".to_owned(),
        job_status: "running".to_owned(),
        kraus_id: None,
        vector_id: None,
        job_data: Some(JobDataResponse {
            channel_id: Some(76),
            number_kraus: Some(10),
            input_dimension: Some(100),
            output_dimension: Some(100),
        }),
    };
    let job = Job::from_response(resp).unwrap();
    assert_eq!(job.kind.output_file_type(), "kraus");
    assert_eq!(job.kind.type_label(), "generate_kraus");
    match job.kind {
        JobKind::GenerateKraus {
            channel_id,
            number_kraus,
            input_dimension,
        } => {
            assert_eq!(channel_id, 76);
            assert_eq!(number_kraus, 10);
            assert_eq!(input_dimension, 100);
        }
        _ => panic!("wrong kind"),
    }
}

#[test]
fn unknown_job_type_is_a_protocol_error() {
    let resp = JobResponse {
        job_id: 1,
        job_type: "frobnicate".to_owned(),
        job_status: "running".to_owned(),
        kraus_id: None,
        vector_id: None,
        job_data: None,
    };
    assert!(Job::from_response(resp).is_err());
}
