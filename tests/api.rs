mod common;

use common::*;
use model_dl::prelude::*;
use model_dl::server;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Api {
    base: String,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl Api {
    async fn get_json(&self, path: &str) -> (reqwest::StatusCode, Value) {
        let resp = self.client.get(format!("{}{}", self.base, path)).send().await.unwrap();
        let status = resp.status();
        let body = resp.text().await.unwrap();
        (status, serde_json::from_str(&body).unwrap())
    }

    async fn post_json(&self, path: &str, body: Value) -> (reqwest::StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.text().await.unwrap();
        (status, serde_json::from_str(&body).unwrap())
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_api(models_dir: &std::path::Path, capacity: usize) -> Api {
    let shutdown = CancellationToken::new();
    let store = JobStore::shared();
    let manager = Arc::new(
        JobManager::new(
            store.clone(),
            WorkerQueue::new(capacity),
            settings(models_dir, 0),
            None,
            shutdown.clone(),
        )
        .unwrap(),
    );
    let broadcaster = ProgressBroadcaster::new(store, Duration::from_millis(20));
    let state = AppState::new(manager, broadcaster, shutdown.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, state, shutdown.clone().cancelled_owned()));

    Api {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        shutdown,
    }
}

/// JSON payloads of every `data:` line in an SSE body.
fn sse_events(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let data = frame
                .strip_prefix("data: ")
                .or_else(|| frame.strip_prefix("data:"))
                .unwrap_or_else(|| panic!("unexpected frame {frame:?}"));
            serde_json::from_str(data).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn health_reports_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let api = spawn_api(dir.path(), 3).await;

    let (status, body) = api.get_json("/api/health").await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["concurrent"], 3);
}

#[tokio::test]
async fn unknown_job_status_is_not_found_with_200() {
    let dir = tempfile::tempdir().unwrap();
    let api = spawn_api(dir.path(), 2).await;

    for id in [uuid::Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
        let (status, body) = api.get_json(&format!("/api/download/status/{id}")).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "ok": false, "error": "not-found" }));
    }
}

#[tokio::test]
async fn start_without_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let api = spawn_api(dir.path(), 2).await;

    let (status, body) = api.post_json("/api/download/start", serde_json::json!({})).await;
    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("sourceId"));

    let (status, body) = api
        .post_json("/api/download/start", serde_json::json!({ "url": "ftp://example.com/w.bin" }))
        .await;
    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn malformed_start_body_uses_error_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let api = spawn_api(dir.path(), 2).await;

    let resp = api
        .client
        .post(format!("{}/api/download/start", api.base))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert_eq!(body["ok"], false);
    assert!(body["error"].is_string());
    assert!(api.get_json("/api/download/jobs").await.1["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn start_then_stream_progress_until_done() {
    let fixture = spawn_fixture().await;
    let dir = tempfile::tempdir().unwrap();
    let api = spawn_api(dir.path(), 2).await;

    let (status, body) = api
        .post_json(
            "/api/download/start",
            serde_json::json!({ "url": fixture.url("fixture.bin"), "filename": "org/model.bin" }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["ok"], true);
    let job_id = body["data"]["jobId"].as_str().unwrap().to_string();
    let out_path = body["data"]["outPath"].as_str().unwrap().to_string();
    assert!(out_path.ends_with("org_model.bin"));

    let resp = api
        .client
        .get(format!("{}/api/download/progress/{job_id}", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()[reqwest::header::CONTENT_TYPE],
        "text/event-stream"
    );
    // The body ends on its own once the terminal event is sent.
    let text = tokio::time::timeout(Duration::from_secs(60), resp.text())
        .await
        .expect("progress stream did not close")
        .unwrap();

    let events = sse_events(&text);
    let (last, before) = events.split_last().unwrap();
    assert_eq!(last["type"], "done");
    assert_eq!(last["bytes"], FIXTURE_LEN as u64);
    assert_eq!(last["sha256"], fixture.digest());
    assert_eq!(last["filePath"], out_path.as_str());
    assert!(before.iter().all(|e| e["type"] == "progress"));

    let (_, body) = api.get_json(&format!("/api/download/status/{job_id}")).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["status"], "done");
    assert_eq!(body["data"]["sha256"], fixture.digest());

    let (_, body) = api
        .get_json(&format!("/api/huggingface/download/status/{job_id}"))
        .await;
    assert_eq!(body["data"]["jobId"], job_id.as_str());
}

#[tokio::test]
async fn failed_job_streams_single_error_event() {
    let fixture = spawn_fixture().await;
    let dir = tempfile::tempdir().unwrap();
    let api = spawn_api(dir.path(), 1).await;

    let (_, body) = api
        .post_json(
            "/api/download/start",
            serde_json::json!({ "url": fixture.url("missing"), "filename": "missing.bin" }),
        )
        .await;
    let job_id = body["data"]["jobId"].as_str().unwrap().to_string();

    let text = tokio::time::timeout(Duration::from_secs(30), async {
        api.client
            .get(format!("{}/api/download/progress/{job_id}", api.base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    })
    .await
    .expect("progress stream did not close");

    let events = sse_events(&text);
    let terminal: Vec<_> = events.iter().filter(|e| e["type"] != "progress").collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(events.last().unwrap()["type"], "error");
    assert_eq!(events.last().unwrap()["error"], "HTTP 404");
}

#[tokio::test]
async fn list_returns_created_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let api = spawn_api(dir.path(), 1).await;

    let (_, created) = api
        .post_json(
            "/api/download/start",
            serde_json::json!({ "modelId": "org/model", "url": "http://127.0.0.1:9/x.bin" }),
        )
        .await;
    let (_, body) = api.get_json("/api/download/jobs").await;
    let jobs = body["data"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["jobId"], created["data"]["jobId"]);
    assert_eq!(jobs[0]["sourceId"], "org/model");
}
