mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use common::{test_app, FakePublisher};
use parley_server::app;
use parley_server::config::Config;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(router: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn reminder_body(at: chrono::DateTime<Utc>) -> Value {
    json!({
        "agent_id": "agent-1",
        "device_id": "dev-1",
        "mac_address": "aa:bb",
        "remind_at": at.to_rfc3339(),
        "title": "Pills",
        "content": "Take your vitamins",
        "useLLM": false
    })
}

#[tokio::test]
async fn health_check_returns_ok() {
    let t = test_app(Config::default(), FakePublisher::unavailable());
    let (status, json) = send(app(t.state.clone()), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn notify_reports_mqtt_delivery_with_200() {
    let t = test_app(Config::default(), FakePublisher::available());
    let (status, json) = send(
        app(t.state.clone()),
        post_json(
            "/api/devices/dev-1/notify",
            json!({"mac_address": "aa:bb", "title": "Hi", "content": "Hello"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["delivered"], true);
    assert_eq!(json["method"], "MQTT");
    assert_eq!(t.publisher.published()[0].0, "device/aa:bb");
}

#[tokio::test]
async fn undeliverable_notify_is_accepted_with_202() {
    let t = test_app(Config::default(), FakePublisher::unavailable());
    let (status, json) = send(
        app(t.state.clone()),
        post_json(
            "/api/devices/dev-1/notify",
            json!({"mac": "aa:bb", "content": "Hello"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["delivered"], false);
    assert_eq!(json["method"], Value::Null);
    assert_eq!(json["error"], "device offline, MQTT not available");
}

#[tokio::test]
async fn malformed_notify_is_rejected_with_400() {
    let t = test_app(Config::default(), FakePublisher::available());

    let request = Request::builder()
        .method("POST")
        .uri("/api/devices/dev-1/notify")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(app(t.state.clone()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app(t.state.clone()),
        post_json(
            "/api/devices/dev-1/notify",
            json!({"mac_address": "aa:bb", "content": "   "}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(t.publisher.published().is_empty());
}

#[tokio::test]
async fn webhook_secret_is_enforced() {
    let mut config = Config::default();
    config.webhook.secret = Some("hook-secret".into());
    let t = test_app(config, FakePublisher::available());
    let body = json!({"mac_address": "aa:bb", "content": "Hello"});

    let (status, _) = send(
        app(t.state.clone()),
        post_json("/api/devices/dev-1/notify", body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut request = post_json("/api/devices/dev-1/notify", body);
    request
        .headers_mut()
        .insert("authorization", "Bearer hook-secret".parse().unwrap());
    let (status, _) = send(app(t.state.clone()), request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(app(t.state.clone()), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn reminder_lifecycle_over_http() {
    let t = test_app(Config::default(), FakePublisher::available());
    let at = Utc::now() + ChronoDuration::hours(1);

    let (status, created) = send(
        app(t.state.clone()),
        post_json("/api/reminders", reminder_body(at)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "PENDING");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = send(app(t.state.clone()), get(&format!("/api/reminders/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["content"], "Take your vitamins");

    let (status, listed) = send(
        app(t.state.clone()),
        get("/api/devices/dev-1/reminders"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Not yet delivered, so it cannot be acknowledged.
    let (status, _) = send(
        app(t.state.clone()),
        post_json(&format!("/api/reminders/{id}/received"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/reminders/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(t.state.clone()), delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(t.state.scheduler().next_run_at().await.unwrap(), None);

    let (status, _) = send(app(t.state.clone()), get(&format!("/api/reminders/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delivered_reminder_can_be_acknowledged() {
    let t = test_app(Config::default(), FakePublisher::available());
    let at = Utc::now() + ChronoDuration::minutes(1);
    let (_, created) = send(
        app(t.state.clone()),
        post_json("/api/reminders", reminder_body(at)),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    t.state
        .scheduler()
        .run_due(at + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(t.publisher.published()[0].0, "reminder/aa:bb");

    let (status, acked) = send(
        app(t.state.clone()),
        post_json(&format!("/api/reminders/{id}/received"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["status"], "RECEIVED");

    let (status, _) = send(
        app(t.state.clone()),
        post_json("/api/reminders/missing/received", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn past_reminder_is_rejected_with_400() {
    let t = test_app(Config::default(), FakePublisher::available());
    let (status, json) = send(
        app(t.state.clone()),
        post_json(
            "/api/reminders",
            reminder_body(Utc::now() - ChronoDuration::minutes(1)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("future"));

    let (status, _) = send(
        app(t.state.clone()),
        post_json("/api/reminders", json!({"device_id": "dev-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn presence_endpoints_reflect_tracker() {
    let t = test_app(Config::default(), FakePublisher::unavailable());
    t.state
        .presence
        .mark_online("dev-2", Some("s-2"), None)
        .await;
    t.state.presence.mark_online("dev-1", None, None).await;

    let (status, json) = send(app(t.state.clone()), get("/api/presence")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["online"], json!(["dev-1", "dev-2"]));

    let (status, json) = send(app(t.state.clone()), get("/api/presence/dev-2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "online");
    assert_eq!(json["session_id"], "s-2");

    let (status, _) = send(app(t.state.clone()), get("/api/presence/dev-9")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
