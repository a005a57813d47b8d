#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use model_dl::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const FIXTURE_LEN: usize = 10 * 1024 * 1024;
pub const SLOW_CHUNKS: usize = 64;
pub const SLOW_CHUNK_LEN: usize = 16 * 1024;
pub const VANISHING_LEN: usize = 256 * 1024;

/// Deterministic 10 MiB payload.
pub fn fixture_bytes() -> Bytes {
    let data: Vec<u8> = (0..FIXTURE_LEN)
        .map(|i| ((i * 31 + i / 4096) % 251) as u8)
        .collect();
    Bytes::from(data)
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[derive(Clone)]
struct FixtureState {
    data: Bytes,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

/// Local HTTP server standing in for the model hub.
pub struct Fixture {
    pub base: String,
    pub data: Bytes,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

impl Fixture {
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// `Range` header of every request the fixture endpoints received.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn digest(&self) -> String {
        sha256_hex(&self.data)
    }
}

pub async fn spawn_fixture() -> Fixture {
    let data = fixture_bytes();
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let state = FixtureState {
        data: data.clone(),
        ranges: ranges.clone(),
    };

    let app = Router::new()
        .route("/fixture.bin", get(ranged))
        .route("/norange.bin", get(ignores_range))
        .route("/slow.bin", get(slow_unsized))
        .route("/truncated.bin", get(truncated))
        .route("/vanishing.bin", get(vanishing))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Fixture {
        base: format!("http://{addr}"),
        data,
        ranges,
    }
}

fn record_range(state: &FixtureState, headers: &HeaderMap) -> Option<u64> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().unwrap().push(range.clone());
    range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|n| n.parse().ok())
}

async fn ranged(State(state): State<FixtureState>, headers: HeaderMap) -> Response {
    let len = state.data.len() as u64;
    match record_range(&state, &headers) {
        Some(start) if start >= len => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        Some(start) => {
            let body = state.data.slice(start as usize..);
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, len - 1, len)),
                    (header::CONTENT_LENGTH, body.len().to_string()),
                ],
                body,
            )
                .into_response()
        }
        None => (
            StatusCode::OK,
            [(header::CONTENT_LENGTH, len.to_string())],
            state.data.clone(),
        )
            .into_response(),
    }
}

async fn ignores_range(State(state): State<FixtureState>, headers: HeaderMap) -> Response {
    record_range(&state, &headers);
    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, state.data.len().to_string())],
        state.data.clone(),
    )
        .into_response()
}

/// Chunked body without a content length, trickled out slowly.
async fn slow_unsized() -> Response {
    let stream = async_stream::stream! {
        for i in 0..SLOW_CHUNKS {
            tokio::time::sleep(Duration::from_millis(3)).await;
            yield Ok::<_, std::io::Error>(Bytes::from(vec![i as u8; SLOW_CHUNK_LEN]));
        }
    };
    Body::from_stream(stream).into_response()
}

/// Promises 1 MiB, sends half of it and then fails the body.
async fn truncated() -> Response {
    let stream = async_stream::stream! {
        yield Ok::<_, std::io::Error>(Bytes::from(vec![7u8; 512 * 1024]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        yield Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "fixture cut the body"));
    };
    (
        [(header::CONTENT_LENGTH, (1024 * 1024).to_string())],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Sends the whole payload, waits until the client has written all of it to
/// `?path=`, deletes that file and only then ends the chunked body.
async fn vanishing(Query(params): Query<HashMap<String, String>>) -> Response {
    let Some(path) = params.get("path").map(PathBuf::from) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let stream = async_stream::stream! {
        yield Ok::<_, std::io::Error>(Bytes::from(vec![9u8; VANISHING_LEN]));
        loop {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() == VANISHING_LEN as u64 => break,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        tokio::fs::remove_file(&path).await.unwrap();
    };
    Body::from_stream(stream).into_response()
}

pub fn settings(models_dir: &Path, max_retained_jobs: usize) -> ManagerSettings {
    ManagerSettings {
        models_dir: models_dir.to_path_buf(),
        hub_endpoint: "https://huggingface.co".into(),
        hub_token: None,
        max_retained_jobs,
    }
}

pub fn manager(models_dir: &Path, capacity: usize) -> Arc<JobManager> {
    Arc::new(
        JobManager::new(
            JobStore::shared(),
            WorkerQueue::new(capacity),
            settings(models_dir, 0),
            None,
            CancellationToken::new(),
        )
        .unwrap(),
    )
}

pub fn start_url(url: String, filename: &str, resume: bool) -> StartRequest {
    StartRequest {
        url: Some(url),
        filename: Some(filename.to_string()),
        resume: Some(resume),
        ..Default::default()
    }
}

/// Poll until the job reaches `done` or `error`.
pub async fn wait_terminal(manager: &JobManager, job_id: Uuid) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if let Some(job) = manager.get_job(job_id).await {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}
