//! The REST API client for the job server (C2).
//!
//! Implements the auth envelope (spec §4.2): every non-auth verb makes sure
//! it holds a valid access token — pinging, and refreshing-then-retrying
//! once on `401` — before issuing the actual request. On any other non-2xx
//! status the wrapped call fails fast without retry.

use std::{
    path::Path,
    sync::Mutex as StdMutex,
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use futures_util::TryStreamExt;
use rand::Rng;
use reqwest::{multipart, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::{fs as async_fs, io::AsyncWriteExt, sync::Mutex as AsyncMutex};
use tokio_util::io::StreamReader;
use url::Url;

use crate::{
    config::WorkerConfig,
    errors::WorkerError,
    models::{Job, JobResponse, Session},
    prelude::*,
};

/// A client for talking to the job server.
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    session: AsyncMutex<Session>,
    status: StdMutex<String>,
    chunk_size: u64,
    max_request_size: u64,
}

impl Client {
    /// Create a new client pointed at `config.api_url`.
    pub fn new(config: &WorkerConfig) -> Result<Client> {
        let base_url = Url::parse(&config.api_url)
            .with_context(|| format!("invalid api_url: {}", config.api_url))?;
        let http = reqwest::Client::builder()
            .build()
            .context("cannot build HTTP client")?;
        Ok(Client {
            http,
            base_url,
            session: AsyncMutex::new(Session::default()),
            status: StdMutex::new("not logged in".to_owned()),
            chunk_size: config.chunk_size,
            max_request_size: config.max_request_size,
        })
    }

    /// The last action this client took and its outcome, for display by the
    /// UI. Advisory only; has no functional effect.
    pub fn status(&self) -> String {
        self.status.lock().expect("status mutex poisoned").clone()
    }

    fn set_status(&self, message: impl Into<String>) {
        *self.status.lock().expect("status mutex poisoned") = message.into();
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("could not build URL from {path:?}"))
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Log in, replacing any existing session.
    #[instrument(skip(self, password), level = "debug")]
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let url = self.join("auth/login")?;
        let resp = self
            .http
            .post(url.clone())
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        if resp.status().is_success() {
            let tokens: TokenPair = self.parse_json(&url, resp).await?;
            let mut session = self.session.lock().await;
            session.set_tokens(tokens.access_token, tokens.refresh_token);
            session.record_auth_check(Utc::now());
            drop(session);
            self.set_status(format!("logged in as {username}"));
            Ok(())
        } else {
            let err = self.classify_error_response(&url, resp).await;
            self.set_status(format!("login failed: {err}"));
            Err(WorkerError::Auth(format!("login failed: {err}")).into())
        }
    }

    /// Exchange the refresh token for a fresh access/refresh token pair.
    ///
    /// On failure, clears the session's tokens (see the note on
    /// [`Session::clear_tokens`] about the open question this resolves).
    #[instrument(skip(self), level = "debug")]
    pub async fn refresh(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let refresh_token = session.refresh_token.clone().ok_or_else(|| {
            WorkerError::Auth("no refresh token available; call login() first".to_owned())
        })?;

        let url = self.join("auth/refresh")?;
        let resp = self
            .http
            .post(url.clone())
            .header("refresh", refresh_token)
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;

        if resp.status().is_success() {
            let tokens: TokenPair = self.parse_json(&url, resp).await?;
            session.set_tokens(tokens.access_token, tokens.refresh_token);
            session.record_auth_check(Utc::now());
            drop(session);
            self.set_status("refreshed access token");
            Ok(())
        } else {
            let err = self.classify_error_response(&url, resp).await;
            session.clear_tokens();
            drop(session);
            self.set_status(format!("refresh failed: {err}"));
            Err(WorkerError::Auth(format!("refresh failed: {err}")).into())
        }
    }

    /// Check whether the current access token is still valid, without
    /// attempting a refresh.
    #[instrument(skip(self), level = "trace")]
    pub async fn ping_auth(&self) -> Result<bool> {
        Ok(self.ping_auth_status().await? == StatusCode::OK)
    }

    /// `GET /auth/ping`, retried with backoff (only this cheap preflight —
    /// never the substantive call itself, see SPEC_FULL.md §4.2).
    async fn ping_auth_status(&self) -> Result<StatusCode> {
        let token = {
            let session = self.session.lock().await;
            session.access_token.clone()
        };
        let Some(token) = token else {
            return Ok(StatusCode::UNAUTHORIZED);
        };
        let url = self.join("auth/ping")?;
        let backoff = ExponentialBuilder::default()
            .with_max_times(3)
            .with_min_delay(Duration::from_millis(100));
        let status = (|| async {
            self.http
                .get(url.clone())
                .bearer_auth(&token)
                .send()
                .await
                .map(|resp| resp.status())
        })
        .retry(backoff)
        .when(|err: &reqwest::Error| err.is_connect() || err.is_timeout())
        .await
        .with_context(|| format!("error getting {url}"))?;
        Ok(status)
    }

    /// Ensure we hold a valid access token, refreshing and retrying the
    /// preflight ping once on `401`.
    async fn ensure_valid_token(&self) -> Result<()> {
        match self.ping_auth_status().await? {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED => {
                self.refresh().await?;
                match self.ping_auth_status().await? {
                    StatusCode::OK => Ok(()),
                    _ => Err(WorkerError::Auth(
                        "access token still invalid after refresh".to_owned(),
                    )
                    .into()),
                }
            }
            other => Err(WorkerError::Transport(format!(
                "unexpected status {other} from /auth/ping"
            ))
            .into()),
        }
    }

    async fn bearer_token(&self) -> Result<String> {
        let session = self.session.lock().await;
        session
            .access_token
            .clone()
            .ok_or_else(|| WorkerError::Auth("not logged in".to_owned()).into())
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// `POST /channels/create`
    #[instrument(skip(self), level = "debug")]
    pub async fn create_channel(
        &self,
        input_dimension: u32,
        output_dimension: u32,
        num_kraus: u32,
        method: &str,
    ) -> Result<serde_json::Value> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("channels/create")?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .form(&[
                ("input_dimension", input_dimension.to_string()),
                ("output_dimension", output_dimension.to_string()),
                ("num_kraus", num_kraus.to_string()),
                ("method", method.to_owned()),
            ])
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        self.handle_json_response(&url, resp).await
    }

    /// `GET /channels/list`
    #[instrument(skip(self), level = "debug")]
    pub async fn list_channels(&self) -> Result<serde_json::Value> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("channels/list")?;
        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("error getting {url}"))?;
        self.handle_json_response(&url, resp).await
    }

    /// `POST /channels/update-minimization-attempts`
    #[instrument(skip(self), level = "debug")]
    pub async fn update_channel_minimization_attempts(
        &self,
        channel_id: i64,
        attempts: u32,
    ) -> Result<serde_json::Value> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("channels/update-minimization-attempts")?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .form(&[
                ("channel_id", channel_id.to_string()),
                ("attempts", attempts.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        self.handle_json_response(&url, resp).await
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// `POST /files/request-upload`
    #[instrument(skip(self), level = "debug")]
    pub async fn request_upload_link(&self) -> Result<String> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("files/request-upload")?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        let body: UploadLinkResponse = self.handle_json_response(&url, resp).await?;
        Ok(body.upload_url)
    }

    /// Upload `local_path` to the server-supplied `upload_link`.
    ///
    /// Single multipart POST if the file is at most `max_request_size`
    /// bytes; otherwise split into sequential chunks sharing one
    /// `session_id`, each posted with 1-based `chunk_index`.
    #[instrument(skip(self), level = "debug")]
    pub async fn upload_file(
        &self,
        job_id: i64,
        file_type: &str,
        local_path: &Path,
        upload_link: &str,
    ) -> Result<()> {
        self.ensure_valid_token().await?;
        let metadata = async_fs::metadata(local_path).await.map_err(|e| {
            WorkerError::Storage(format!(
                "cannot stat {} for upload: {e}",
                local_path.display()
            ))
        })?;
        let size = metadata.len();

        if size <= self.max_request_size {
            let data = async_fs::read(local_path).await.map_err(|e| {
                WorkerError::Storage(format!("cannot read {}: {e}", local_path.display()))
            })?;
            self.post_chunk(job_id, file_type, upload_link, data, 1, 1, None)
                .await?;
        } else {
            let total_chunks = size.div_ceil(self.max_request_size);
            let total_chunks = u32::try_from(total_chunks)
                .map_err(|_| WorkerError::Storage("file too large to chunk".to_owned()))?;
            let session_id = random_session_id();
            let bytes = async_fs::read(local_path).await.map_err(|e| {
                WorkerError::Storage(format!("cannot read {}: {e}", local_path.display()))
            })?;
            for chunk_index in 1..=total_chunks {
                let start = (u64::from(chunk_index - 1)) * self.max_request_size;
                let end = (start + self.max_request_size).min(size);
                let chunk = bytes[start as usize..end as usize].to_vec();
                self.post_chunk(
                    job_id,
                    file_type,
                    upload_link,
                    chunk,
                    chunk_index,
                    total_chunks,
                    Some(session_id.as_str()),
                )
                .await?;
            }
        }
        self.set_status(format!("uploaded output for job {job_id}"));
        Ok(())
    }

    /// POST a single chunk (or the whole file, when `total_chunks == 1`) to
    /// `upload_link`.
    async fn post_chunk(
        &self,
        job_id: i64,
        file_type: &str,
        upload_link: &str,
        data: Vec<u8>,
        chunk_index: u32,
        total_chunks: u32,
        session_id: Option<&str>,
    ) -> Result<()> {
        let token = self.bearer_token().await?;
        let url = self.join(upload_link)?;
        let mut form = multipart::Form::new()
            .text("job_id", job_id.to_string())
            .text("file_type", file_type.to_owned())
            .text("total_chunks", total_chunks.to_string())
            .text("chunk_index", chunk_index.to_string())
            .part("file", multipart::Part::bytes(data).file_name("chunk"));
        if let Some(session_id) = session_id {
            form = form.text("session_id", session_id.to_owned());
        }
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("error posting chunk {chunk_index}/{total_chunks} to {url}"))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let err = self.classify_error_response(&url, resp).await;
            Err(format_err!(
                "upload chunk {chunk_index}/{total_chunks} failed: {err}"
            ))
        }
    }

    /// `POST /files/request-download/`
    #[instrument(skip(self), level = "debug")]
    pub async fn request_download_link(&self, file_id: &str) -> Result<String> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("files/request-download/")?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .json(&json!({ "file_id": file_id }))
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        let body: DownloadLinkResponse = self.handle_json_response(&url, resp).await?;
        Ok(body.download_url)
    }

    /// Stream the body at `download_link` into `local_path`, creating it if
    /// absent and overwriting it if it already exists.
    #[instrument(skip(self), level = "debug")]
    pub async fn download_file(&self, download_link: &str, local_path: &Path) -> Result<()> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join(download_link)?;
        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("error getting {url}"))?;
        if !resp.status().is_success() {
            let err = self.classify_error_response(&url, resp).await;
            return Err(format_err!("download failed: {err}"));
        }

        let file = async_fs::File::create(local_path).await.map_err(|e| {
            WorkerError::Storage(format!(
                "cannot create destination file {}: {e}",
                local_path.display()
            ))
        })?;

        // Adapt the response's byte stream into an `AsyncRead` and copy it
        // through a buffer sized to `chunk_size`, so the body is written to
        // disk in `chunk_size` pieces rather than held in memory whole.
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(stream);
        let mut writer = tokio::io::BufWriter::with_capacity(self.chunk_size as usize, file);
        tokio::io::copy(&mut reader, &mut writer).await.map_err(|e| {
            WorkerError::Storage(format!(
                "error streaming download body to {}: {e}",
                local_path.display()
            ))
        })?;
        writer.flush().await.map_err(|e| {
            WorkerError::Storage(format!("error flushing {}: {e}", local_path.display()))
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// `GET /jobs/request`. Returns `None` on `204` (no jobs available).
    #[instrument(skip(self), level = "debug")]
    pub async fn get_job(&self) -> Result<Option<Job>> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("jobs/request")?;
        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("error getting {url}"))?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let raw: JobResponse = self.handle_json_response(&url, resp).await?;
        Ok(Some(Job::from_response(raw)?))
    }

    /// `POST /jobs/ping`
    #[instrument(skip(self), level = "trace")]
    pub async fn ping_job(&self, job_id: i64) -> Result<()> {
        self.post_job_action("jobs/ping", job_id).await
    }

    /// `POST /jobs/pause`
    #[instrument(skip(self), level = "debug")]
    pub async fn pause_job(&self, job_id: i64) -> Result<()> {
        self.post_job_action("jobs/pause", job_id).await
    }

    /// `POST /jobs/resume`
    #[instrument(skip(self), level = "debug")]
    pub async fn resume_job(&self, job_id: i64) -> Result<()> {
        self.post_job_action("jobs/resume", job_id).await
    }

    /// `POST /jobs/complete`
    #[instrument(skip(self), level = "debug")]
    pub async fn complete_job(&self, job_id: i64) -> Result<()> {
        self.post_job_action("jobs/complete", job_id).await
    }

    /// `POST /jobs/cancel`
    #[instrument(skip(self), level = "debug")]
    pub async fn cancel_job(&self, job_id: i64) -> Result<()> {
        self.post_job_action("jobs/cancel", job_id).await
    }

    /// `POST {job_id}` to `path`, discarding the JSON body on success.
    async fn post_job_action(&self, path: &str, job_id: i64) -> Result<()> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join(path)?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .form(&[("job_id", job_id.to_string())])
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        self.handle_empty_response(&url, resp).await
    }

    /// `POST /jobs/update-iterations`
    #[instrument(skip(self), level = "debug")]
    pub async fn update_iterations(&self, job_id: i64, num_iterations: u64) -> Result<()> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("jobs/update-iterations")?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .form(&[
                ("job_id", job_id.to_string()),
                ("num_iterations", num_iterations.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        self.handle_empty_response(&url, resp).await
    }

    /// `POST /jobs/update-entropy`
    #[instrument(skip(self), level = "debug")]
    pub async fn update_entropy(&self, job_id: i64, entropy: f64) -> Result<()> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("jobs/update-entropy")?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .form(&[
                ("job_id", job_id.to_string()),
                ("entropy", entropy.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        self.handle_empty_response(&url, resp).await
    }

    /// `POST /jobs/status`
    #[instrument(skip(self), level = "trace")]
    pub async fn get_status(&self, job_id: i64) -> Result<serde_json::Value> {
        self.ensure_valid_token().await?;
        let token = self.bearer_token().await?;
        let url = self.join("jobs/status")?;
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .form(&[("job_id", job_id.to_string())])
            .send()
            .await
            .with_context(|| format!("error posting {url}"))?;
        self.handle_json_response(&url, resp).await
    }

    // ------------------------------------------------------------------
    // Response handling
    // ------------------------------------------------------------------

    async fn parse_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        resp: reqwest::Response,
    ) -> Result<T> {
        let text = resp
            .text()
            .await
            .with_context(|| format!("error reading body of {url}"))?;
        serde_json::from_str(&text)
            .map_err(|e| WorkerError::Protocol(format!("malformed response from {url}: {e}")).into())
    }

    async fn handle_json_response<T: DeserializeOwned>(
        &self,
        url: &Url,
        resp: reqwest::Response,
    ) -> Result<T> {
        if resp.status().is_success() {
            self.parse_json(url, resp).await
        } else {
            let err = self.classify_error_response(url, resp).await;
            Err(err)
        }
    }

    async fn handle_empty_response(&self, url: &Url, resp: reqwest::Response) -> Result<()> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.classify_error_response(url, resp).await)
        }
    }

    /// Build a classified [`Error`] from a non-2xx response.
    async fn classify_error_response(&self, url: &Url, resp: reqwest::Response) -> Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = format!("unexpected status {status} from {url}: {body}");
        self.set_status(message.clone());
        if status == StatusCode::UNAUTHORIZED {
            WorkerError::Auth(message).into()
        } else {
            WorkerError::Transport(message).into()
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Generate a 128-bit random hex string for use as an upload `session_id`.
fn random_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, serde::Deserialize)]
struct TokenPair {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, serde::Deserialize)]
struct UploadLinkResponse {
    upload_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct DownloadLinkResponse {
    download_url: String,
}

#[test]
fn random_session_ids_are_32_hex_chars() {
    let id = random_session_id();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn chunk_count_boundary() {
    let max: u64 = 50 * 1024 * 1024;
    assert_eq!(max.div_ceil(max), 1);
    assert_eq!((max + 1).div_ceil(max), 2);
}
