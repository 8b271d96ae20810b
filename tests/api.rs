//! HTTP API integration tests
//!
//! A full server on an ephemeral port, driven over HTTP with a scripted task
//! backend standing in for real containers.

mod common;

use anyhow::Result;
use argosy::{
    config::Config,
    persist::Database,
    runtime::TaskState,
    server::{build_services, create_router, start_background},
    workflow::types::ConcurrencyPolicy,
};
use common::{container, cron_workflow, dag, task, workflow, ScriptedBackend};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "test-token";

/// A server running in the background
struct TestServer {
    addr: SocketAddr,
    client: Client,
    backend: Arc<ScriptedBackend>,
    shutdown: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let mut config = Config::default();
        config.auth.token = Some(TOKEN.to_string());
        config.server.default_namespace = "argo".to_string();
        config.controller.resync_seconds = 1;
        config.cron.enabled = false;

        let backend = Arc::new(ScriptedBackend::new());
        let services = build_services(&config, Database::in_memory().await?, backend.clone()).await?;
        let shutdown = CancellationToken::new();
        start_background(&services, &config, shutdown.clone()).await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = create_router(services.state.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            client: Client::new(),
            backend,
            shutdown,
            _handle: handle,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(TOKEN)
    }

    fn post(&self, path: &str, body: &impl serde::Serialize) -> RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(TOKEN).json(body)
    }

    fn put(&self, path: &str) -> RequestBuilder {
        self.client.put(self.url(path)).bearer_auth(TOKEN)
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.client.delete(self.url(path)).bearer_auth(TOKEN)
    }

    async fn phase(&self, name: &str) -> Result<String> {
        let body: Value = self
            .get(&format!("/api/v1/workflows/argo/{}", name))
            .send()
            .await?
            .json()
            .await?;
        Ok(body["status"]["phase"].as_str().unwrap_or_default().to_string())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll `check` until it holds or five seconds pass
async fn eventually<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check().await? {
                return Ok::<(), anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?
}

#[tokio::test]
async fn test_health_needs_no_auth() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = server.client.get(server.url("/healthz")).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await?, "ok");

    Ok(())
}

#[tokio::test]
async fn test_api_requires_token() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = server.client.get(server.url("/api/v1/workflows/argo")).send().await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .client
        .get(server.url("/api/v1/workflows/argo"))
        .bearer_auth("wrong")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await?;
    assert_eq!(body["code"], 401);

    Ok(())
}

#[tokio::test]
async fn test_submitted_workflow_runs_and_is_archived() -> Result<()> {
    let server = TestServer::start().await?;
    let wf = workflow(
        "pipeline",
        "main",
        vec![
            dag("main", vec![task("fetch", "step", &[]), task("load", "step", &["fetch"])]),
            container("step"),
        ],
    );

    let resp = server.post("/api/v1/workflows/argo", &wf).send().await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await?;
    let uid = created["metadata"]["uid"].as_str().unwrap_or_default().to_string();
    assert!(!uid.is_empty());
    assert_ne!(uid, "uid-pipeline");

    let backend = server.backend.clone();
    eventually(|| {
        let backend = backend.clone();
        async move { Ok(backend.dispatched("pipeline.fetch")) }
    })
    .await?;
    server.backend.finish("pipeline.fetch", TaskState::Succeeded);

    eventually(|| {
        let backend = backend.clone();
        async move { Ok(backend.dispatched("pipeline.load")) }
    })
    .await?;
    server.backend.finish("pipeline.load", TaskState::Succeeded);

    let server = &server;
    eventually(|| async move { Ok(server.phase("pipeline").await? == "Succeeded") }).await?;

    let body: Value = server.get("/api/v1/workflows/argo/pipeline").send().await?.json().await?;
    assert_eq!(body["status"]["nodes"].as_object().map(|n| n.len()), Some(3));

    let archived_path = format!("/api/v1/archived-workflows/{}", uid);
    let archived_path = archived_path.as_str();
    eventually(|| async move {
        let resp = server.get(archived_path).send().await?;
        Ok(resp.status() == StatusCode::OK)
    })
    .await?;

    let list: Value = server
        .get("/api/v1/archived-workflows?namespace=argo&phases=Succeeded")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(list["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(list["items"][0]["name"], "pipeline");

    let resp = server
        .put(&format!("/api/v1/archived-workflows/argo/{}/resubmit", uid))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resubmitted: Value = resp.json().await?;
    assert!(resubmitted["metadata"]["name"]
        .as_str()
        .unwrap_or_default()
        .starts_with("pipeline-"));

    let resp = server
        .delete(&format!("/api/v1/archived-workflows/argo/{}", uid))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = server.get(&format!("/api/v1/archived-workflows/{}", uid)).send().await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_submission_errors_map_to_status_codes() -> Result<()> {
    let server = TestServer::start().await?;
    let wf = workflow("twice", "step", vec![container("step")]);

    let resp = server.post("/api/v1/workflows/argo", &wf).send().await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = server.post("/api/v1/workflows/argo", &wf).send().await?;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let invalid = workflow("broken", "missing", vec![container("step")]);
    let resp = server.post("/api/v1/workflows/argo", &invalid).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert!(body["error"].as_str().unwrap_or_default().contains("Invalid workflow"));

    let resp = server.post("/api/v1/workflows/other", &wf).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server.get("/api/v1/workflows/argo/ghost").send().await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_terminate_and_delete_workflow() -> Result<()> {
    let server = TestServer::start().await?;
    let wf = workflow("long", "step", vec![container("step")]);
    server.post("/api/v1/workflows/argo", &wf).send().await?;

    let backend = server.backend.clone();
    eventually(|| {
        let backend = backend.clone();
        async move { Ok(backend.dispatched("long")) }
    })
    .await?;

    let resp = server.put("/api/v1/workflows/argo/long/terminate").send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["spec"]["shutdown"], "Terminate");

    let server = &server;
    eventually(|| async move { Ok(server.phase("long").await? == "Failed") }).await?;
    assert_eq!(server.backend.terminated().len(), 1);

    // a completed workflow cannot be stopped again
    let resp = server.put("/api/v1/workflows/argo/long/stop").send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server.delete("/api/v1/workflows/argo/long").send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = server.get("/api/v1/workflows/argo/long").send().await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_cron_workflow_crud() -> Result<()> {
    let server = TestServer::start().await?;
    let cron = cron_workflow("hourly", "0 * * * *", ConcurrencyPolicy::Forbid);

    let resp = server.post("/api/v1/cron-workflows/argo", &cron).send().await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let mut bad = cron_workflow("typo", "every hour", ConcurrencyPolicy::Allow);
    bad.metadata.namespace = String::new();
    let resp = server.post("/api/v1/cron-workflows/argo", &bad).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let list: Value = server.get("/api/v1/cron-workflows/argo").send().await?.json().await?;
    assert_eq!(list["items"].as_array().map(Vec::len), Some(1));

    let suspended: Value = server
        .put("/api/v1/cron-workflows/argo/hourly/suspend")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(suspended["spec"]["suspend"], true);

    let resumed: Value = server
        .put("/api/v1/cron-workflows/argo/hourly/resume")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(resumed["spec"]["suspend"], false);

    let resp = server.delete("/api/v1/cron-workflows/argo/hourly").send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = server.get("/api/v1/cron-workflows/argo/hourly").send().await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
}
