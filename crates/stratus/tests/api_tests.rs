//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tower::ServiceExt;

mod common;
use common::{WEBHOOK_SECRET, test_app};

fn sign(body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn create_body(name: &str) -> String {
    serde_json::to_string(&json!({
        "name": name,
        "url": "https://example.com/demo.git",
        "start_command": "sleep 30",
        "port": 3000,
    }))
    .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn create_repository(app: &common::TestApp, name: &str) -> Value {
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/repositories")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(create_body(name)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_create_repository_spawns_session() {
    let app = test_app().await;

    let created = create_repository(&app, "demo").await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["alias"], "demo");
    assert!(created["webhook_id"].is_string());

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/repositories/{}/status", id))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status = json_body(response).await;
    assert_eq!(status["state"], "running");
    assert!(status["started_at"].is_string());

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_invalid_repository_is_rejected() {
    let app = test_app().await;

    let body = serde_json::to_string(&json!({
        "name": "bad",
        "url": "https://example.com/demo.git",
        "start_command": "sleep 30",
        "root_directory": "../escape",
        "port": 3000,
    }))
    .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/repositories")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_get_unknown_repository_is_404() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/repositories/nope")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_domain_only_update_keeps_process() {
    let app = test_app().await;

    let created = create_repository(&app, "demo").await;
    let id = created["id"].as_str().unwrap().to_string();
    let before = app.manager.status(&id).await.unwrap().started_at;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/repositories/{}", id))
                .method(Method::PATCH)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_string(&json!({ "domains": ["app.example.com"] })).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let updated = json_body(response).await;
    assert_eq!(updated["domains"][0], "app.example.com");

    assert_eq!(app.manager.status(&id).await.unwrap().started_at, before);

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_reports_clean_teardown() {
    let app = test_app().await;

    let created = create_repository(&app, "demo").await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/repositories/{}", id))
                .method(Method::DELETE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let report = json_body(response).await;
    assert_eq!(report["repository_id"], id.as_str());
    assert_eq!(report["failures"].as_array().unwrap().len(), 0);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/repositories/{}", id))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let app = test_app().await;

    let created = create_repository(&app, "demo").await;
    let id = created["id"].as_str().unwrap().to_string();

    let body = json!({ "ref": "refs/heads/main" }).to_string();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/webhooks/{}", id))
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-hub-signature-256", "sha256=deadbeef")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_webhook_ignores_other_branches() {
    let app = test_app().await;

    let created = create_repository(&app, "demo").await;
    let id = created["id"].as_str().unwrap().to_string();

    let body = json!({ "ref": "refs/heads/feature" }).to_string();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/webhooks/{}", id))
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-hub-signature-256", sign(&body))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["disposition"], "ignored");

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_webhook_push_redeploys_and_lists_deployment() {
    let app = test_app().await;

    let created = create_repository(&app, "demo").await;
    let id = created["id"].as_str().unwrap().to_string();

    let body = json!({
        "ref": "refs/heads/main",
        "head_commit": {
            "id": "abc123",
            "message": "ship it",
            "author": { "name": "alice" },
        },
    })
    .to_string();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/webhooks/{}", id))
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-hub-signature-256", sign(&body))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["disposition"], "redeployed");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/repositories/{}/deployments", id))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let deployments = json_body(response).await;
    let list = deployments.as_array().unwrap();
    // One record from creation, one from the push.
    assert_eq!(list.len(), 2);
    assert!(
        list.iter()
            .any(|d| d["commit_message"] == "ship it" && d["commit_author"] == "alice")
    );

    app.manager.shutdown().await;
}

#[tokio::test]
async fn test_log_history_endpoint() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/repositories/demo/logs")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let created = create_repository(&app, "demo").await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/repositories/{}/logs", id))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["repository_id"], id.as_str());
    assert!(
        json["history"]
            .as_str()
            .unwrap()
            .contains("starting stage: sleep 30")
    );

    app.manager.shutdown().await;
}
