use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::manager::ManagerSettings;

/// Download service for model files. Every flag can also be set from the environment.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Downloads allowed to run at the same time
    #[arg(long, env = "MAX_CONCURRENT_DOWNLOADS", default_value_t = 2)]
    pub max_concurrent_downloads: usize,

    #[arg(long, env = "MODELS_DIR", default_value = "models")]
    pub models_dir: PathBuf,

    #[arg(long, env = "HF_ENDPOINT", default_value = "https://huggingface.co")]
    pub hf_endpoint: String,

    /// Bearer token for gated repositories, sent only to the HF endpoint host
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    #[arg(long, env = "PROGRESS_INTERVAL_MS", default_value_t = 500)]
    pub progress_interval_ms: u64,

    /// Finished jobs kept in memory (0 = unlimited)
    #[arg(long, env = "MAX_RETAINED_JOBS", default_value_t = 0)]
    pub max_retained_jobs: usize,

    /// SQLite file recording finished jobs
    #[arg(long = "history-db", env = "DOWNLOAD_HISTORY_DB")]
    pub history_db: Option<PathBuf>,
}

impl Config {
    /// Fail fast on values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            bail!("MAX_CONCURRENT_DOWNLOADS must be at least 1");
        }
        if !self.hf_endpoint.starts_with("http://") && !self.hf_endpoint.starts_with("https://") {
            bail!("HF_ENDPOINT must start with http:// or https://");
        }
        if self.progress_interval_ms == 0 {
            bail!("PROGRESS_INTERVAL_MS must be positive");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// `models_dir` made absolute against the working directory.
    pub fn absolute_models_dir(&self) -> Result<PathBuf> {
        if self.models_dir.is_absolute() {
            return Ok(self.models_dir.clone());
        }
        let cwd = std::env::current_dir().context("cannot read working directory")?;
        Ok(cwd.join(&self.models_dir))
    }

    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        Ok(ManagerSettings {
            models_dir: self.absolute_models_dir()?,
            hub_endpoint: self.hf_endpoint.clone(),
            hub_token: self.hf_token.clone(),
            max_retained_jobs: self.max_retained_jobs,
        })
    }
}
