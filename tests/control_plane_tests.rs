//! Control-plane HTTP contract: auth, job CRUD, stats, pipeline context
//! and history endpoints.

use std::sync::Arc;

use devos_orchestrator::events::EventBus;
use devos_orchestrator::pipeline::{PipelineState, PipelineStateMachine};
use devos_orchestrator::queue::{JobQueue, QueueConfig};
use devos_orchestrator::server::{router, ApiContext, StaticTokenVerifier};
use devos_orchestrator::store::{FileJobStore, FilePipelineStore};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    pipeline: Arc<PipelineStateMachine>,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(JobQueue::new(
        Arc::new(FileJobStore::new(dir.path().join("jobs"))),
        QueueConfig {
            workers: 0,
            ..QueueConfig::default()
        },
    ));
    let pipeline = Arc::new(PipelineStateMachine::new(
        Arc::new(FilePipelineStore::new(dir.path().join("pipeline"))),
        EventBus::default(),
        3,
    ));
    let ctx = Arc::new(ApiContext {
        queue,
        pipeline: pipeline.clone(),
        verifier: Arc::new(StaticTokenVerifier::new(Some("secret-token".to_string()))),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(ctx)).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        pipeline,
        _dir: dir,
    }
}

fn job_body() -> serde_json::Value {
    serde_json::json!({
        "jobType": "execute-task",
        "data": {
            "projectId": "proj-1",
            "agentType": "dev",
            "storyId": "11-4",
            "gitRepoUrl": "https://github.com/owner/repo.git",
        },
        "priority": 10,
    })
}

async fn create_job(server: &TestServer) -> serde_json::Value {
    let response = server
        .client
        .post(format!("{}/workspaces/ws-1/agent-queue/jobs", server.base_url))
        .bearer_auth("secret-token")
        .json(&job_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

#[tokio::test]
async fn create_job_returns_201_with_pending_status() {
    let server = start_server().await;
    let body = create_job(&server).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["jobType"], "execute-task");
    assert!(body["id"].as_str().is_some());
    assert!(body["createdAt"].as_str().is_some());
}

#[tokio::test]
async fn missing_bearer_token_is_401() {
    let server = start_server().await;
    let response = server
        .client
        .post(format!("{}/workspaces/ws-1/agent-queue/jobs", server.base_url))
        .json(&job_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn wrong_bearer_token_is_403() {
    let server = start_server().await;
    let response = server
        .client
        .get(format!("{}/workspaces/ws-1/agent-queue/stats", server.base_url))
        .bearer_auth("not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn invalid_job_type_is_400() {
    let server = start_server().await;
    let response = server
        .client
        .post(format!("{}/workspaces/ws-1/agent-queue/jobs", server.base_url))
        .bearer_auth("secret-token")
        .json(&serde_json::json!({
            "jobType": "definitely-not-a-job",
            "data": { "projectId": "proj-1" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn out_of_range_priority_is_400() {
    let server = start_server().await;
    let mut body = job_body();
    body["priority"] = serde_json::json!(101);
    let response = server
        .client
        .post(format!("{}/workspaces/ws-1/agent-queue/jobs", server.base_url))
        .bearer_auth("secret-token")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn get_job_is_workspace_scoped() {
    let server = start_server().await;
    let created = create_job(&server).await;
    let id = created["id"].as_str().unwrap();

    let found = server
        .client
        .get(format!(
            "{}/workspaces/ws-1/agent-queue/jobs/{id}",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(found.status(), 200);
    let job: serde_json::Value = found.json().await.unwrap();
    assert_eq!(job["workspaceId"], "ws-1");
    assert_eq!(job["payload"]["storyId"], "11-4");

    // The same id through another workspace is a 404, not a 403.
    let cross = server
        .client
        .get(format!(
            "{}/workspaces/ws-2/agent-queue/jobs/{id}",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(cross.status(), 404);
}

#[tokio::test]
async fn list_jobs_pages_and_validates_limits() {
    let server = start_server().await;
    for _ in 0..3 {
        create_job(&server).await;
    }

    let response = server
        .client
        .get(format!(
            "{}/workspaces/ws-1/agent-queue/jobs?limit=2&offset=0",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(body["limit"], 2);

    let too_big = server
        .client
        .get(format!(
            "{}/workspaces/ws-1/agent-queue/jobs?limit=500",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(too_big.status(), 400);
}

#[tokio::test]
async fn cancel_then_cancel_again_is_409() {
    let server = start_server().await;
    let created = create_job(&server).await;
    let id = created["id"].as_str().unwrap();

    let cancelled = server
        .client
        .delete(format!(
            "{}/workspaces/ws-1/agent-queue/jobs/{id}",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(cancelled.status(), 200);
    let job: serde_json::Value = cancelled.json().await.unwrap();
    assert_eq!(job["status"], "failed");
    assert_eq!(job["errorMessage"], "Cancelled by user");

    let again = server
        .client
        .delete(format!(
            "{}/workspaces/ws-1/agent-queue/jobs/{id}",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 409);
}

#[tokio::test]
async fn cancel_missing_job_is_404() {
    let server = start_server().await;
    let response = server
        .client
        .delete(format!(
            "{}/workspaces/ws-1/agent-queue/jobs/no-such-job",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn stats_reflect_queue_contents() {
    let server = start_server().await;
    create_job(&server).await;
    create_job(&server).await;

    let response = server
        .client
        .get(format!("{}/workspaces/ws-1/agent-queue/stats", server.base_url))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let stats: serde_json::Value = response.json().await.unwrap();
    assert_eq!(stats["waiting"], 2);
    assert_eq!(stats["active"], 0);
    assert_eq!(stats["completed"], 0);
    assert_eq!(stats["failed"], 0);
}

#[tokio::test]
async fn pipeline_context_and_history_endpoints() {
    let server = start_server().await;
    server
        .pipeline
        .ensure_context("proj-1", "ws-1", "bmad-proj-1")
        .await
        .unwrap();
    server
        .pipeline
        .transition(
            "proj-1",
            PipelineState::Planning,
            "planner job started",
            serde_json::json!({}),
        )
        .await
        .unwrap();

    let context = server
        .client
        .get(format!(
            "{}/workspaces/ws-1/orchestrator/proj-1",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(context.status(), 200);
    let context: serde_json::Value = context.json().await.unwrap();
    assert_eq!(context["currentState"], "planning");
    assert_eq!(context["previousState"], "idle");

    let history = server
        .client
        .get(format!(
            "{}/workspaces/ws-1/orchestrator/proj-1/history?limit=10",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(history.status(), 200);
    let rows: serde_json::Value = history.json().await.unwrap();
    assert_eq!(rows[0]["fromState"], "idle");
    assert_eq!(rows[0]["toState"], "planning");

    // A context from another workspace is invisible.
    let cross = server
        .client
        .get(format!(
            "{}/workspaces/ws-2/orchestrator/proj-1",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(cross.status(), 404);

    let missing = server
        .client
        .get(format!(
            "{}/workspaces/ws-1/orchestrator/ghost",
            server.base_url
        ))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}
