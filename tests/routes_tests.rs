mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use common::{request, seed_knowledge_base, wait_for_terminal, ScriptedProvider};
use coursegen_runtime::job::JobStatus;
use coursegen_runtime::pipeline::{CourseGenerator, PipelineSettings};
use coursegen_runtime::routes::{self, AppState, StartGenerationResponse};
use coursegen_runtime::storage::memory::MemoryStorage;

fn app(storage: Arc<MemoryStorage>) -> Router {
    let generator = CourseGenerator::new(
        storage,
        Arc::new(ScriptedProvider::new()),
        PipelineSettings::default(),
    );
    routes::router(AppState { generator })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn start_then_poll_until_completed() {
    let storage = Arc::new(MemoryStorage::new());
    let kb = seed_knowledge_base(&storage, 2, 2);
    let app = app(storage.clone());

    let body = serde_json::to_value(request(kb, 1, 1)).unwrap();
    let (status, json) = send(&app, "POST", "/api/course-generation", Some(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let started: StartGenerationResponse = serde_json::from_value(json).unwrap();
    assert_eq!(started.status, JobStatus::Queued);

    let done = wait_for_terminal(storage.as_ref(), started.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);

    let (status, json) = send(
        &app,
        "GET",
        &format!("/api/course-generation/{}", started.job_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "completed");
    assert_eq!(json["progress"], 100);

    let outline_id = json["result"]["outline_id"].as_str().unwrap().to_string();
    let (status, json) = send(&app, "GET", &format!("/api/outlines/{outline_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outline"]["modules"].as_array().unwrap().len(), 1);

    // finished jobs cannot be cancelled
    let (status, json) = send(
        &app,
        "POST",
        &format!("/api/course-generation/{}/cancel", started.job_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn invalid_request_is_a_bad_request() {
    let storage = Arc::new(MemoryStorage::new());
    let kb = seed_knowledge_base(&storage, 1, 1);
    let app = app(storage);

    let body = serde_json::to_value(request(kb, 0, 1)).unwrap();
    let (status, json) = send(&app, "POST", "/api/course-generation", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("duration_weeks"));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let app = app(Arc::new(MemoryStorage::new()));
    let id = Uuid::new_v4();

    let (status, json) = send(&app, "GET", &format!("/api/course-generation/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "NOT_FOUND");

    let cancel_uri = format!("/api/course-generation/{id}/cancel");
    let (status, _) = send(&app, "POST", &cancel_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", &format!("/api/outlines/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
