mod common;

use bytes::Bytes;
use common::{test_app, FakePublisher, TestApp};
use futures_util::{SinkExt, StreamExt};
use parley_server::app;
use parley_server::config::Config;
use parley_server::dispatcher::DeliveryRoute;
use parley_server::registry::Outbound;
use parley_types::{DeliveryMethod, DeliveryTarget, NotificationPayload};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn serve(t: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(t.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr, device_id: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?device_id={device_id}"))
        .await
        .unwrap();
    ws
}

async fn next_message(ws: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("websocket error")
}

async fn next_json(ws: &mut Client) -> Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn connected_device_receives_webhook_over_websocket() {
    let t = test_app(Config::default(), FakePublisher::available());
    let addr = serve(&t).await;
    let mut ws = connect(addr, "dev-1").await;

    let state = t.state.clone();
    eventually(|| {
        let state = state.clone();
        async move { state.registry.contains("dev-1") && state.presence.is_online("dev-1").await }
    })
    .await;

    let status = t.state.presence.status("dev-1").await.unwrap();
    assert_eq!(status.status, "online");
    assert!(status.session_id.is_some());

    let result = t
        .state
        .dispatcher
        .dispatch(
            &DeliveryTarget::new("dev-1", "aa:bb"),
            DeliveryRoute::Webhook,
            &NotificationPayload::new("Hi", "Hello there", true),
        )
        .await;
    assert!(result.delivered);
    assert_eq!(result.method, Some(DeliveryMethod::WebSocket));

    let json = next_json(&mut ws).await;
    assert_eq!(json["type"], "notification");
    assert_eq!(json["title"], "Hi");
    assert_eq!(json["content"], "Hello there");
    assert!(t.publisher.published().is_empty());
}

#[tokio::test]
async fn speech_is_bracketed_by_tts_envelopes() {
    let mut config = Config::default();
    config.audio.frame_duration_ms = 5;
    config.audio.prebuffer_frames = 1;
    let t = test_app(config, FakePublisher::unavailable());
    let addr = serve(&t).await;
    let mut ws = connect(addr, "dev-1").await;

    let state = t.state.clone();
    eventually(|| {
        let state = state.clone();
        async move { state.registry.contains("dev-1") }
    })
    .await;

    let frames: Vec<Bytes> = (0..4u8).map(|i| Bytes::from(vec![i; 16])).collect();
    let session = t.state.registry.get("dev-1").unwrap();
    session
        .sender
        .send(Outbound::Speech {
            text: Some("good morning".into()),
            frames: frames.clone(),
        })
        .await
        .unwrap();

    let start = next_json(&mut ws).await;
    assert_eq!(start["type"], "tts");
    assert_eq!(start["state"], "start");
    let session_id = start["session_id"].as_str().unwrap().to_string();
    assert_eq!(session_id, session.session_id.to_string());

    let sentence = next_json(&mut ws).await;
    assert_eq!(sentence["state"], "sentence_start");
    assert_eq!(sentence["text"], "good morning");

    for frame in &frames {
        match next_message(&mut ws).await {
            Message::Binary(data) => assert_eq!(&data[..], &frame[..]),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    let stop = next_json(&mut ws).await;
    assert_eq!(stop["state"], "stop");
    assert_eq!(stop["session_id"], session_id.as_str());
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let t = test_app(Config::default(), FakePublisher::unavailable());
    let addr = serve(&t).await;
    let mut ws = connect(addr, "dev-1").await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn disconnect_clears_presence_and_registry() {
    let t = test_app(Config::default(), FakePublisher::unavailable());
    let addr = serve(&t).await;
    let mut ws = connect(addr, "dev-1").await;

    let state = t.state.clone();
    eventually(|| {
        let state = state.clone();
        async move { state.presence.is_online("dev-1").await }
    })
    .await;

    ws.close(None).await.unwrap();

    let state = t.state.clone();
    eventually(|| {
        let state = state.clone();
        async move { !state.registry.contains("dev-1") && !state.presence.is_online("dev-1").await }
    })
    .await;
}

#[tokio::test]
async fn reconnect_keeps_the_newer_session_online() {
    let t = test_app(Config::default(), FakePublisher::unavailable());
    let addr = serve(&t).await;
    let mut first = connect(addr, "dev-1").await;

    let state = t.state.clone();
    eventually(|| {
        let state = state.clone();
        async move { state.registry.contains("dev-1") }
    })
    .await;
    let first_session = t.state.registry.get("dev-1").unwrap().session_id;

    let _second = connect(addr, "dev-1").await;
    let state = t.state.clone();
    eventually(|| {
        let state = state.clone();
        async move {
            state
                .registry
                .get("dev-1")
                .is_some_and(|s| s.session_id != first_session)
        }
    })
    .await;

    // The replaced session is told to close.
    loop {
        match next_message(&mut first).await {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame on replaced session: {other:?}"),
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t.state.registry.contains("dev-1"));
    assert!(t.state.presence.is_online("dev-1").await);
    let current = t.state.registry.get("dev-1").unwrap().session_id;
    let status = t.state.presence.status("dev-1").await.unwrap();
    assert_eq!(status.session_id, Some(current.to_string()));
}

#[tokio::test]
async fn upgrade_without_device_id_is_rejected() {
    let t = test_app(Config::default(), FakePublisher::unavailable());
    let addr = serve(&t).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
}
