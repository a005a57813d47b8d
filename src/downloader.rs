use crate::integrity::{sha256_sum, IntegrityError};
use crate::models::{self, DownloadReport, JobRecord, JobStatus};
use crate::store::SharedStore;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode, Url};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("connection failed: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("server answered HTTP {}", .0.as_u16())]
    Status(StatusCode),
    #[error("response body interrupted: {0}")]
    Body(#[source] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("download cancelled")]
    Cancelled,
    #[error("job {0} not found")]
    UnknownJob(Uuid),
}

impl DownloadError {
    /// Localized text stored in the job's `error` field.
    pub fn user_message(&self) -> String {
        match self {
            DownloadError::Connect(e) => format!("اتصال ناموفق: {e}"),
            DownloadError::Status(status) => format!("HTTP {}", status.as_u16()),
            DownloadError::Body(e) => format!("دریافت داده قطع شد: {e}"),
            DownloadError::Io(e) => format!("خطای نوشتن فایل: {e}"),
            DownloadError::Integrity(e) => format!("محاسبهٔ هش ناموفق بود: {e}"),
            DownloadError::Cancelled => "دانلود لغو شد".to_string(),
            DownloadError::UnknownJob(id) => format!("کار {id} یافت نشد"),
        }
    }
}

/// Current throughput in megabits per second and the remaining time in seconds.
///
/// Both are measured from the start of this attempt, with `received` counting
/// any resumed prefix. ETA is 0 while the speed or the total is unknown.
pub fn throughput(received: u64, total: u64, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    let speed_mbps = if secs > 0.0 {
        (received as f64 * 8.0) / (secs * 1e6)
    } else {
        0.0
    };
    let eta_sec = if speed_mbps > 0.0 && total > 0 {
        (total.saturating_sub(received) as f64 * 8.0) / (speed_mbps * 1e6)
    } else {
        0.0
    };
    (speed_mbps, eta_sec)
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Performs single download attempts with byte-range resume, writing progress
/// into the job store as chunks arrive.
#[derive(Clone)]
pub struct ResumableFetcher {
    client: Client,
    store: SharedStore,
    cancel: CancellationToken,
    /// Host and bearer token for gated hub downloads.
    bearer: Option<(String, String)>,
}

impl ResumableFetcher {
    pub fn new(client: Client, store: SharedStore, cancel: CancellationToken) -> Self {
        Self {
            client,
            store,
            cancel,
            bearer: None,
        }
    }

    /// Send `token` as a bearer credential to URLs on `host` only.
    pub fn with_bearer_token(mut self, host: impl Into<String>, token: impl Into<String>) -> Self {
        self.bearer = Some((host.into(), token.into()));
        self
    }

    /// Run one attempt for `job_id`. The job always ends in `done` or `error`;
    /// the returned error is for the caller's logs only.
    pub async fn run(&self, job_id: Uuid, resume: bool) -> Result<(), DownloadError> {
        let job = self
            .store
            .get(&job_id)
            .ok_or(DownloadError::UnknownJob(job_id))?;

        let result = self.attempt(&job, resume).await;
        if let Err(e) = &result {
            error!(job_id = %job_id, "download failed: {e}");
            let message = e.user_message();
            self.store.update(&job_id, |j| {
                j.status = JobStatus::Error;
                j.error = Some(message);
                j.message = models::MSG_FAILED.to_string();
                j.speed_mbps = 0.0;
                j.eta_sec = 0.0;
                j.finished_at = now_secs();
            });
        }
        result
    }

    async fn attempt(&self, job: &JobRecord, resume: bool) -> Result<(), DownloadError> {
        let id = job.job_id;
        let path = job.file_path.as_path();
        let started_at = now_secs();
        self.store.update(&id, |j| {
            j.status = JobStatus::Starting;
            j.message = models::MSG_CONNECTING.to_string();
            j.started_at = started_at;
        });

        let mut start_byte = if resume { existing_len(path).await } else { 0 };

        let mut request = self.client.get(&job.source_url);
        if start_byte > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", start_byte));
        }
        if let Some(token) = self.token_for(&job.source_url) {
            request = request.bearer_auth(token);
        }
        debug!(job_id = %id, url = %job.source_url, start_byte, "sending request");

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            sent = request.send() => sent.map_err(DownloadError::Connect)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }
        if start_byte > 0 && status != StatusCode::PARTIAL_CONTENT {
            warn!(job_id = %id, %status, "server ignored range request, restarting from byte 0");
            start_byte = 0;
        }

        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let total = start_byte + content_length;

        self.store.update(&id, |j| {
            j.total = total;
            j.received = start_byte;
            j.resumed_from = start_byte;
            j.status = JobStatus::Downloading;
            j.message = if start_byte > 0 {
                models::resumed_message(start_byte)
            } else {
                models::MSG_RECEIVING.to_string()
            };
        });
        info!(job_id = %id, start_byte, total, "download started");

        let mut file = if start_byte > 0 {
            OpenOptions::new().create(true).append(true).open(path).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .await?
        };

        let streamed = self.stream_body(id, response, &mut file, start_byte, total).await;
        // Keep whatever was written so a later attempt can resume from it.
        let flushed = file.flush().await;
        drop(file);
        let received = streamed?;
        flushed?;

        self.store.update(&id, |j| j.message = models::MSG_HASHING.to_string());
        let digest = sha256_sum(path).await?;

        let finished_at = now_secs();
        let duration_sec = (finished_at - started_at).max(1);
        let avg_speed_mbps = (received as f64 * 8.0) / (duration_sec as f64 * 1e6);
        let finished = self.store.update(&id, |j| {
            j.sha256 = Some(digest);
            j.finished_at = finished_at;
            j.received = received;
            j.bytes = received;
            j.duration_sec = Some(duration_sec);
            j.avg_speed_mbps = Some(avg_speed_mbps);
            j.eta_sec = 0.0;
            j.status = JobStatus::Done;
            j.message = models::MSG_DONE.to_string();
            j.clone()
        });
        info!(job_id = %id, bytes = received, duration_sec, "download finished");

        if let Some(job) = finished {
            write_report(&job).await;
        }
        Ok(())
    }

    /// Copies the body into `file`, returning the final byte count on disk.
    async fn stream_body(
        &self,
        id: Uuid,
        response: Response,
        file: &mut File,
        start_byte: u64,
        total: u64,
    ) -> Result<u64, DownloadError> {
        let started = Instant::now();
        let mut received = start_byte;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let bytes = chunk.map_err(DownloadError::Body)?;

            file.write_all(&bytes).await?;
            received += bytes.len() as u64;

            let (speed_mbps, eta_sec) = throughput(received, total, started.elapsed());
            self.store.update(&id, |j| {
                j.received = received;
                j.speed_mbps = speed_mbps;
                j.eta_sec = eta_sec;
            });
        }
        Ok(received)
    }

    fn token_for(&self, url: &str) -> Option<&str> {
        let (host, token) = self.bearer.as_ref()?;
        let url = Url::parse(url).ok()?;
        (url.host_str() == Some(host.as_str())).then_some(token.as_str())
    }
}

/// Size of a partial file to resume from, or 0.
async fn existing_len(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

/// Best effort: a failed report never changes the job's outcome.
async fn write_report(job: &JobRecord) {
    let report = DownloadReport::from_job(job);
    let report_path = DownloadReport::path_for(&job.file_path);
    let written = match serde_json::to_vec_pretty(&report) {
        Ok(body) => tokio::fs::write(&report_path, body).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = written {
        warn!(job_id = %job.job_id, path = %report_path.display(), "could not write report: {e}");
    }
}
