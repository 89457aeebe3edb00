mod common;

use common::{send, test_state, TestApp};
use identity_service::{build_router, ServiceSlot};
use service_core::axum::{
    body::Body,
    http::{Request, StatusCode},
};
use std::sync::Arc;

#[tokio::test]
async fn health_reports_ready_identity() {
    let app = TestApp::new().await;

    let response = app.get("/health").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert_eq!(response.body["service"], "identity-service-test");
    assert_eq!(response.body["identity"], "ready");
}

#[tokio::test]
async fn unavailable_identity_keeps_health_up_and_fails_auth_safely() {
    let router = build_router(test_state(ServiceSlot::Unavailable(Arc::from(
        "Failed to read key /etc/keys/private.pem: No such file",
    ))));

    let health = send(&router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body["identity"], "unavailable");

    let login = send(
        &router,
        Request::post("/auth/login")
            .header("content-type", "application/json")
            .header("x-app-id", "app1")
            .body(Body::from(
                r#"{"value":"a@b.test","password":"whatever-long"}"#,
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(login.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(login.body["error"], "identity service unavailable");
    assert!(!login.body.to_string().contains("private.pem"));

    let jwks = send(
        &router,
        Request::get("/.well-known/jwks.json").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(jwks.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn request_id_is_generated_and_propagated() {
    let app = TestApp::new().await;

    let generated = app.get("/health").await;
    assert!(generated.headers.contains_key("x-request-id"));

    let echoed = app
        .send(
            Request::get("/health")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(echoed.headers["x-request-id"], "req-42");
}

#[tokio::test]
async fn missing_app_id_is_rejected() {
    let app = TestApp::new().await;

    let response = app
        .send(
            Request::post("/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"value":"a@b.test","password":"x"}"#))
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}
