// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Status line shown while a job waits for a free queue slot.
pub const MSG_QUEUED: &str = "در صف دانلود...";
pub const MSG_CONNECTING: &str = "در حال اتصال...";
pub const MSG_RECEIVING: &str = "در حال دریافت...";
pub const MSG_HASHING: &str = "در حال محاسبهٔ هش...";
pub const MSG_DONE: &str = "دانلود کامل شد";
pub const MSG_FAILED: &str = "دانلود ناموفق بود";

/// Status line for an attempt that continues a partial file.
pub fn resumed_message(start_byte: u64) -> String {
    format!("از بایت {} ادامه می‌دهد", start_byte)
}

/// The status of a download job.
///
/// `queued -> starting -> downloading -> (done | error)`. The last two are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Starting,
    Downloading,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// The full lifecycle state of one download attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Hub repository the URL was resolved from, if any.
    pub source_id: Option<String>,
    pub source_url: String,
    pub file_path: PathBuf,

    /// Bytes on disk for this file, counting any resumed prefix.
    pub received: u64,
    /// Resume offset plus the remaining content length; 0 when unknown.
    pub total: u64,
    pub speed_mbps: f64,
    pub eta_sec: f64,

    pub sha256: Option<String>,
    pub error: Option<String>,
    pub message: String,

    pub started_at: i64,
    pub finished_at: i64,
    pub duration_sec: Option<i64>,
    pub avg_speed_mbps: Option<f64>,
    pub bytes: u64,
    pub resumed_from: u64,
}

impl JobRecord {
    pub fn new(job_id: Uuid, source_id: Option<String>, source_url: String, file_path: PathBuf) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            source_id,
            source_url,
            file_path,
            received: 0,
            total: 0,
            speed_mbps: 0.0,
            eta_sec: 0.0,
            sha256: None,
            error: None,
            message: MSG_QUEUED.to_string(),
            started_at: 0,
            finished_at: 0,
            duration_sec: None,
            avg_speed_mbps: None,
            bytes: 0,
            resumed_from: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Percentage complete, or 0 when the total size is unknown.
    pub fn progress_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.received as f64 / self.total as f64) * 100.0
        }
    }

    /// The event a progress subscriber should see for the current state.
    pub fn to_event(&self) -> ProgressEvent {
        match self.status {
            JobStatus::Error => ProgressEvent::Error {
                error: self.error.clone().unwrap_or_else(|| MSG_FAILED.to_string()),
            },
            JobStatus::Done => ProgressEvent::Done {
                file_path: self.file_path.clone(),
                bytes: self.bytes,
                sha256: self.sha256.clone().unwrap_or_default(),
                duration_sec: self.duration_sec.unwrap_or(1),
                avg_speed_mbps: self.avg_speed_mbps.unwrap_or(0.0),
            },
            _ => ProgressEvent::Progress {
                pct: self.progress_pct(),
                speed_mbps: self.speed_mbps,
                eta_sec: self.eta_sec,
                message: self.message.clone(),
            },
        }
    }
}

/// One event on the progress stream, serialized as `{"type": ..., ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        pct: f64,
        speed_mbps: f64,
        eta_sec: f64,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        file_path: PathBuf,
        bytes: u64,
        sha256: String,
        duration_sec: i64,
        avg_speed_mbps: f64,
    },
    Error { error: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

/// Body of a start request. Every field is optional; `url` wins over `sourceId`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(alias = "modelId")]
    pub source_id: Option<String>,
    pub revision: Option<String>,
    pub url: Option<String>,
    pub filename: Option<String>,
    pub resume: Option<bool>,
}

/// Audit record written next to a finished file as `<file>.report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadReport {
    #[serde(rename = "modelId")]
    pub source_id: Option<String>,
    pub url: String,
    pub file_path: PathBuf,
    pub bytes: u64,
    pub total: u64,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_sec: i64,
    pub avg_speed_mbps: f64,
    pub sha256: Option<String>,
    pub resumed_from_byte: u64,
    pub status: JobStatus,
}

impl DownloadReport {
    pub fn from_job(job: &JobRecord) -> Self {
        let avg = job.avg_speed_mbps.unwrap_or(0.0);
        Self {
            source_id: job.source_id.clone(),
            url: job.source_url.clone(),
            file_path: job.file_path.clone(),
            bytes: job.bytes,
            total: job.total,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_sec: job.duration_sec.unwrap_or(1),
            avg_speed_mbps: (avg * 1000.0).round() / 1000.0,
            sha256: job.sha256.clone(),
            resumed_from_byte: job.resumed_from,
            status: job.status,
        }
    }

    /// e.g., for "/models/a.bin", it returns "/models/a.bin.report.json"
    pub fn path_for(file_path: &Path) -> PathBuf {
        let mut name = file_path.as_os_str().to_owned();
        name.push(".report.json");
        PathBuf::from(name)
    }
}

/// Replaces characters that are unsafe in file names (`\ / : * ? " < > |`) with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}
