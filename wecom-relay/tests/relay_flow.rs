//! End-to-end webhook flow tests.
//!
//! Drives the relay through the HTTP callback with real encrypted
//! envelopes, a mocked WeCom API, and captured gateway channels.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_common::{Config, Locale, WeComConfig};
use wecom_relay::dispatch::{welcome_text, PENDING_TTL};
use wecom_relay::{
    build_router, crypto, AppState, BindingStore, Frame, GatewayHandle, SessionTimeouts,
};

const TEST_KEY: &str = "7oCvxzgCP3d3RLzzfhitAz2aiG3HyprpiVSDeH3W4bQ";

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1".into(),
        http_port: 0,
        ws_port: 0,
        auth_secret: "relay-secret".into(),
        wecom: WeComConfig {
            corp_id: "ww-corp".into(),
            app_secret: "app-secret".into(),
            callback_token: "cb-token".into(),
            encoding_aes_key: TEST_KEY.into(),
            open_kfid: "kfc001".into(),
            kf_url: Some("https://work.weixin.qq.com/kf/kfc001".into()),
        },
        locale: Locale::Zh,
        log_level: "info".into(),
        log_format: "pretty".into(),
    }
}

async fn state_with_mock(server: &MockServer) -> Arc<AppState> {
    Mock::given(method("GET"))
        .and(path("/gettoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok",
            "access_token": "AT", "expires_in": 7200
        })))
        .mount(server)
        .await;

    AppState::with_options(test_config(), Some(&server.uri()), SessionTimeouts::default())
        .expect("test state")
}

/// Attach a fake gateway straight into the registry, capturing its frames.
fn connect_gateway(
    state: &Arc<AppState>,
    gateway_id: &str,
) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    state.registry.register(Arc::new(GatewayHandle::new(
        gateway_id,
        state.registry.next_seq(),
        tx,
    )));
    rx
}

/// Build a signed webhook request around an encrypted inner envelope.
fn webhook_request(state: &Arc<AppState>, event_token: &str) -> Request<Body> {
    let inner = format!(
        "<xml>\
         <ToUserName><![CDATA[ww-corp]]></ToUserName>\
         <CreateTime>1700000000</CreateTime>\
         <MsgType><![CDATA[event]]></MsgType>\
         <Event><![CDATA[kf_msg_or_event]]></Event>\
         <Token><![CDATA[{event_token}]]></Token>\
         <OpenKfId><![CDATA[kfc001]]></OpenKfId>\
         </xml>"
    );
    let encrypt = crypto::encrypt(&inner, "ww-corp", &state.keys).unwrap();
    let signature = crypto::compute_signature("cb-token", "1700000000", "n1", &encrypt);
    let body = format!("<xml><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>");

    Request::builder()
        .method(Method::POST)
        .uri(format!(
            "/wecom/callback?msg_signature={signature}&timestamp=1700000000&nonce=n1"
        ))
        .body(Body::from(body))
        .unwrap()
}

async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> Frame {
    let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for gateway frame")
        .expect("gateway channel closed");
    match message {
        Message::Text(text) => Frame::decode(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn text_token_binding_flow() {
    let server = MockServer::start().await;
    let state = state_with_mock(&server).await;
    let mut gw_rx = connect_gateway(&state, "gw-A");

    let token = state.bindings.create_pending("gw-A", PENDING_TTL);

    Mock::given(method("POST"))
        .and(path("/kf/sync_msg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok",
            "next_cursor": "", "has_more": 0,
            "msg_list": [{
                "msgtype": "text",
                "msgid": "M1",
                "external_userid": "u1",
                "open_kfid": "kfc001",
                "send_time": 1700000000,
                "origin": 3,
                "text": { "content": token }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/kf/send_msg"))
        .and(body_partial_json(serde_json::json!({
            "touser": "u1",
            "text": { "content": welcome_text(Locale::Zh) }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok", "msgid": "W1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_router(state.clone());
    let response = app.oneshot(webhook_request(&state, "EVT-1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The gateway is told its binding resolved
    assert_eq!(
        recv_frame(&mut gw_rx).await,
        Frame::BindingResolved {
            external_user_id: "u1".into(),
            gateway_id: "gw-A".into(),
        }
    );
    // The raw token text is never forwarded as content
    assert!(gw_rx.try_recv().is_err());

    // The binding is committed and the token consumed
    assert_eq!(state.bindings.lookup("u1").as_deref(), Some("gw-A"));
    assert_eq!(state.bindings.resolve_pending(&token), None);
}

#[tokio::test]
async fn scene_param_binding_flow() {
    let server = MockServer::start().await;
    let state = state_with_mock(&server).await;
    let mut gw_rx = connect_gateway(&state, "gw-B");

    let token = state.bindings.create_pending("gw-B", PENDING_TTL);

    Mock::given(method("POST"))
        .and(path("/kf/sync_msg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok",
            "next_cursor": "", "has_more": 0,
            "msg_list": [{
                "msgtype": "event",
                "external_userid": "u2",
                "open_kfid": "kfc001",
                "event": {
                    "event_type": "enter_session",
                    "scene_param": token
                }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/kf/send_msg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok", "msgid": "W2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_router(state.clone());
    app.oneshot(webhook_request(&state, "EVT-2")).await.unwrap();

    assert_eq!(
        recv_frame(&mut gw_rx).await,
        Frame::BindingResolved {
            external_user_id: "u2".into(),
            gateway_id: "gw-B".into(),
        }
    );
    assert_eq!(state.bindings.lookup("u2").as_deref(), Some("gw-B"));
}

#[tokio::test]
async fn routed_image_message_flow() {
    let server = MockServer::start().await;
    let state = state_with_mock(&server).await;
    let mut gw_rx = connect_gateway(&state, "gw-C");

    state.bindings.bind("u3", "gw-C");

    Mock::given(method("POST"))
        .and(path("/kf/sync_msg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok",
            "next_cursor": "", "has_more": 0,
            "msg_list": [{
                "msgtype": "image",
                "msgid": "M3",
                "external_userid": "u3",
                "open_kfid": "kfc001",
                "send_time": 1700000000,
                "origin": 3,
                "image": { "media_id": "MID-1" }
            }]
        })))
        .mount(&server)
        .await;

    let app = build_router(state.clone());
    app.oneshot(webhook_request(&state, "EVT-3")).await.unwrap();

    match recv_frame(&mut gw_rx).await {
        Frame::Inbound {
            id,
            external_user_id,
            msg_type,
            content,
            timestamp,
        } => {
            assert!(uuid::Uuid::parse_str(&id).is_ok());
            assert_eq!(external_user_id, "u3");
            assert_eq!(msg_type, "image");
            assert_eq!(content, "MID-1");
            assert_eq!(timestamp, 1700000000);
        }
        other => panic!("expected inbound frame, got {other:?}"),
    }
}

#[tokio::test]
async fn multi_page_batch_is_dispatched_in_order() {
    let server = MockServer::start().await;
    let state = state_with_mock(&server).await;
    let mut gw_rx = connect_gateway(&state, "gw-C");

    state.bindings.bind("u3", "gw-C");

    Mock::given(method("POST"))
        .and(path("/kf/sync_msg"))
        .and(body_partial_json(serde_json::json!({ "cursor": "" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok",
            "next_cursor": "C1", "has_more": 1,
            "msg_list": [{
                "msgtype": "text", "external_userid": "u3", "origin": 3,
                "send_time": 1, "text": { "content": "first" }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/kf/sync_msg"))
        .and(body_partial_json(serde_json::json!({ "cursor": "C1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errcode": 0, "errmsg": "ok",
            "next_cursor": "", "has_more": 0,
            "msg_list": [{
                "msgtype": "text", "external_userid": "u3", "origin": 3,
                "send_time": 2, "text": { "content": "second" }
            }]
        })))
        .mount(&server)
        .await;

    let app = build_router(state.clone());
    app.oneshot(webhook_request(&state, "EVT-4")).await.unwrap();

    let first = recv_frame(&mut gw_rx).await;
    let second = recv_frame(&mut gw_rx).await;
    assert!(matches!(first, Frame::Inbound { ref content, .. } if content == "first"));
    assert!(matches!(second, Frame::Inbound { ref content, .. } if content == "second"));
}
