// src/manager.rs

use crate::downloader::ResumableFetcher;
use crate::models::{sanitize_filename, JobRecord, StartRequest};
use crate::queue::{Task, WorkerQueue};
use crate::state_manager::StateManager;
use crate::store::SharedStore;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

const DEFAULT_REVISION: &str = "main";
const DEFAULT_HUB_FILE: &str = "pytorch_model.bin";
const DEFAULT_FILENAME: &str = "model.bin";
const HISTORY_LIST_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("could not prepare {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Settings the manager needs from the process configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Absolute directory all downloads land in.
    pub models_dir: PathBuf,
    /// Base URL used to build `<endpoint>/<sourceId>/resolve/<revision>/pytorch_model.bin`.
    pub hub_endpoint: String,
    pub hub_token: Option<String>,
    /// Finished jobs kept in memory; 0 keeps all of them.
    pub max_retained_jobs: usize,
}

/// Returned to the client that asked for a download.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedJob {
    pub job_id: Uuid,
    pub out_path: PathBuf,
}

/// Creates jobs, hands them to the worker queue and answers lookups.
pub struct JobManager {
    store: SharedStore,
    queue: WorkerQueue,
    fetcher: ResumableFetcher,
    history: Option<StateManager>,
    settings: ManagerSettings,
}

impl JobManager {
    pub fn new(
        store: SharedStore,
        queue: WorkerQueue,
        settings: ManagerSettings,
        history: Option<StateManager>,
        cancel: CancellationToken,
    ) -> Result<Self, ManagerError> {
        let client = Client::builder()
            .user_agent(concat!("model-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut fetcher = ResumableFetcher::new(client, store.clone(), cancel);
        if let Some(token) = &settings.hub_token {
            match Url::parse(&settings.hub_endpoint).ok().and_then(|u| u.host_str().map(str::to_string)) {
                Some(host) => fetcher = fetcher.with_bearer_token(host, token.clone()),
                None => warn!("hub token configured but endpoint {} has no host", settings.hub_endpoint),
            }
        }

        Ok(Self {
            store,
            queue,
            fetcher,
            history,
            settings,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn queue(&self) -> &WorkerQueue {
        &self.queue
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Validates the request, registers a `queued` job and enqueues its download.
    /// The network fetch starts only once the queue admits the task.
    pub async fn create_job(&self, request: StartRequest) -> Result<StartedJob, ManagerError> {
        let url = self.resolve_url(&request)?;
        let out_path = self.resolve_path(&request)?;

        tokio::fs::create_dir_all(&self.settings.models_dir)
            .await
            .map_err(|source| ManagerError::Filesystem {
                path: self.settings.models_dir.display().to_string(),
                source,
            })?;

        let job_id = Uuid::new_v4();
        let source_id = request.source_id.clone().filter(|s| !s.trim().is_empty());
        self.store
            .insert(JobRecord::new(job_id, source_id, url.clone(), out_path.clone()));

        self.queue.enqueue(DownloadTask {
            job_id,
            resume: request.resume.unwrap_or(true),
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
            history: self.history.clone(),
            max_retained_jobs: self.settings.max_retained_jobs,
        });
        info!(job_id = %job_id, %url, path = %out_path.display(), "job queued");

        Ok(StartedJob { job_id, out_path })
    }

    /// Current state of a job, falling back to the history database for jobs
    /// no longer held in memory.
    pub async fn get_job(&self, job_id: Uuid) -> Option<JobRecord> {
        if let Some(job) = self.store.get(&job_id) {
            return Some(job);
        }
        let history = self.history.as_ref()?;
        match history.load_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, "history lookup failed: {e}");
                None
            }
        }
    }

    /// Jobs in memory (newest first), followed by recently finished jobs that
    /// only the history database still holds.
    pub async fn list_jobs(&self) -> Vec<JobRecord> {
        let mut jobs = self.store.list();
        let Some(history) = &self.history else {
            return jobs;
        };
        match history.recent_jobs(HISTORY_LIST_LIMIT).await {
            Ok(recent) => {
                let known: HashSet<Uuid> = jobs.iter().map(|j| j.job_id).collect();
                jobs.extend(recent.into_iter().filter(|j| !known.contains(&j.job_id)));
            }
            Err(e) => warn!("history listing failed: {e}"),
        }
        jobs
    }

    /// Explicit `url` if given, else the hub resolve URL for `sourceId`.
    pub fn resolve_url(&self, request: &StartRequest) -> Result<String, ManagerError> {
        let non_empty = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        let url = match (non_empty(&request.url), non_empty(&request.source_id)) {
            (Some(url), _) => url,
            (None, Some(source_id)) => {
                let revision = non_empty(&request.revision).unwrap_or_else(|| DEFAULT_REVISION.to_string());
                format!(
                    "{}/{}/resolve/{}/{}",
                    self.settings.hub_endpoint.trim_end_matches('/'),
                    source_id,
                    revision,
                    DEFAULT_HUB_FILE
                )
            }
            (None, None) => {
                return Err(ManagerError::InvalidRequest(
                    "either url or sourceId is required".into(),
                ))
            }
        };

        let parsed = Url::parse(&url)
            .map_err(|e| ManagerError::InvalidRequest(format!("bad url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ManagerError::InvalidRequest(format!(
                "unsupported url scheme: {}",
                parsed.scheme()
            )));
        }
        Ok(url)
    }

    /// Destination under the models directory with a sanitized file name.
    pub fn resolve_path(&self, request: &StartRequest) -> Result<PathBuf, ManagerError> {
        let raw = request
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                request
                    .source_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|id| format!("{id}.bin"))
            })
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

        let name = sanitize_filename(&raw);
        if name == "." || name == ".." {
            return Err(ManagerError::InvalidRequest(format!("invalid filename: {raw}")));
        }
        Ok(self.settings.models_dir.join(name))
    }
}

/// One queued download plus the bookkeeping that follows it.
struct DownloadTask {
    job_id: Uuid,
    resume: bool,
    fetcher: ResumableFetcher,
    store: SharedStore,
    history: Option<StateManager>,
    max_retained_jobs: usize,
}

#[async_trait]
impl Task for DownloadTask {
    async fn execute(self: Box<Self>) -> anyhow::Result<()> {
        let span = info_span!("download", job_id = %self.job_id);
        async move {
            let result = self.fetcher.run(self.job_id, self.resume).await;
            self.record_outcome().await;
            result.with_context(|| format!("download {} failed", self.job_id))
        }
        .instrument(span)
        .await
    }
}

impl DownloadTask {
    async fn record_outcome(&self) {
        if let (Some(history), Some(job)) = (&self.history, self.store.get(&self.job_id)) {
            if let Err(e) = history.save_job(&job).await {
                warn!(job_id = %self.job_id, "could not record job history: {e}");
            }
        }
        if self.max_retained_jobs > 0 {
            let evicted = self.store.evict_terminal(self.max_retained_jobs);
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "evicted finished jobs");
            }
        }
    }
}
