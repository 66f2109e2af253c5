use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use jobhub::{
    broker::memory::InMemoryBroker, store::memory::InMemoryStore, worker::Outcome, JobHub,
};
use jobhub_server::{
    routes::{router, AppState},
    tasks,
};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    hub: JobHub,
}

impl TestApp {
    fn new() -> Self {
        let hub = tasks::register(JobHub::new(InMemoryStore::new(), InMemoryBroker::new()));
        Self {
            router: router(AppState::new(&hub)),
            hub,
        }
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn get(&self, uri: &str, user_id: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, &[("x-user-id", user_id)], None)
            .await
    }

    async fn enqueue(&self, user_id: i64, input: Value) -> String {
        let (status, body) = self
            .send(
                Method::POST,
                "/jobs",
                &[],
                Some(json!({
                    "task_type": "echo",
                    "owner_user_id": user_id,
                    "input_payload": input,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        body["job_id"].as_str().unwrap().to_owned()
    }

    async fn run_next(&self) -> Option<Outcome> {
        self.hub
            .worker_pool()
            .run_next(Duration::from_millis(100))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn enqueue_returns_queued_job_id() {
    let app = TestApp::new();

    let (status, body) = app
        .send(
            Method::POST,
            "/jobs",
            &[],
            Some(json!({
                "task_type": "echo",
                "owner_user_id": 1,
                "owner_tenant_id": 10,
                "input_payload": {"value": 42},
            })),
        )
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap();

    let (status, job) = app.get(&format!("/jobs/{job_id}"), "1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "queued");
    assert_eq!(job["progress"], 0);
    assert_eq!(job["owner_tenant_id"], 10);
    assert!(job.get("result").is_none());
}

#[tokio::test]
async fn unknown_task_type_is_rejected() {
    let app = TestApp::new();

    let (status, body) = app
        .send(
            Method::POST,
            "/jobs",
            &[],
            Some(json!({"task_type": "resize_image", "owner_user_id": 1})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_task_type");
}

#[tokio::test]
async fn malformed_requests_get_json_errors() {
    let app = TestApp::new();

    let (status, body) = app
        .send(
            Method::POST,
            "/jobs",
            &[],
            Some(json!({"task_type": "echo"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_body");
    assert!(body["message"].is_string());

    let (status, body) = app.get("/jobs?status=sleeping", "1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_query");
}

#[tokio::test]
async fn input_with_nul_character_is_rejected() {
    let app = TestApp::new();

    let (status, body) = app
        .send(
            Method::POST,
            "/jobs",
            &[],
            Some(json!({
                "task_type": "echo",
                "owner_user_id": 1,
                "input_payload": {"name": "a\u{0}b"},
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn result_round_trips_once_completed() {
    let app = TestApp::new();
    let job_id = app.enqueue(1, json!({"value": 42})).await;

    let (status, body) = app.get(&format!("/jobs/{job_id}/result"), "1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_ready");

    assert_eq!(app.run_next().await, Some(Outcome::Completed));

    let (status, job) = app.get(&format!("/jobs/{job_id}"), "1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress"], 100);
    assert_eq!(job["result"], json!({"value": 42}));

    let (status, result) = app.get(&format!("/jobs/{job_id}/result"), "1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result, json!({"value": 42}));
}

#[tokio::test]
async fn callers_are_identified_by_header() {
    let app = TestApp::new();
    let job_id = app.enqueue(1, json!(null)).await;

    let (status, body) = app
        .send(Method::GET, &format!("/jobs/{job_id}"), &[], None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");

    let (status, _) = app
        .send(
            Method::GET,
            "/jobs",
            &[("x-user-id", "1"), ("x-role", "superuser")],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn jobs_of_other_owners_are_hidden() {
    let app = TestApp::new();
    let job_id = app.enqueue(1, json!(null)).await;

    let (status, body) = app.get(&format!("/jobs/{job_id}"), "2").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, _) = app
        .send(
            Method::GET,
            &format!("/jobs/{job_id}"),
            &[("x-user-id", "2"), ("x-role", "admin")],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .get("/jobs/00000000-0000-0000-0000-000000000000", "1")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.get("/jobs/not-a-job", "1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_is_scoped_filtered_and_paginated() {
    let app = TestApp::new();
    let mut mine = vec![];
    for value in 0..3 {
        mine.push(app.enqueue(1, json!({"value": value})).await);
    }
    let theirs = app.enqueue(2, json!(null)).await;

    let (status, body) = app.get("/jobs?page_size=2", "1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["page"], 1);
    assert_eq!(body["page_size"], 2);
    let listed = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|job| job["job_id"].as_str().unwrap().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(listed.len(), 2);
    assert!(!listed.contains(&theirs));
    assert!(listed.iter().all(|id| mine.contains(id)));

    let (_, body) = app.get("/jobs?page=2&page_size=2", "1").await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    let (_, body) = app.get("/jobs?status=completed&task_type=echo", "1").await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn stats_count_by_status() {
    let app = TestApp::new();
    app.enqueue(1, json!(null)).await;
    app.enqueue(1, json!(null)).await;
    app.enqueue(2, json!(null)).await;
    assert_eq!(app.run_next().await, Some(Outcome::Completed));

    let (status, body) = app
        .send(
            Method::GET,
            "/jobs/stats",
            &[("x-user-id", "1"), ("x-role", "admin")],
            None,
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["completed"], 1);
    assert_eq!(body["queued"], 2);
    assert_eq!(body["failed"], 0);
    assert_eq!(body["jobs_last_24h"], 3);
    assert!(body["avg_processing_time"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn cancel_fails_queued_job_once() {
    let app = TestApp::new();
    let job_id = app.enqueue(1, json!(null)).await;
    let uri = format!("/jobs/{job_id}");

    let (status, job) = app
        .send(Method::DELETE, &uri, &[("x-user-id", "1")], None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"], "cancelled by user");

    let (status, body) = app
        .send(Method::DELETE, &uri, &[("x-user-id", "1")], None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_terminal");

    assert_eq!(app.run_next().await, Some(Outcome::Discarded));
}
