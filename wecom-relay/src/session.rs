//! Gateway WebSocket sessions.
//!
//! One task per accepted socket. A connection must authenticate with a
//! `hello` frame inside the handshake window, after which it is registered
//! and served until close, error, heartbeat timeout, or replacement by a
//! newer connection with the same gateway id.

use crate::binding::BindingStore;
use crate::crypto::constant_time_eq;
use crate::dispatch::PENDING_TTL;
use crate::frame::Frame;
use crate::registry::GatewayHandle;
use crate::AppState;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Close code for a missed handshake window.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
/// Close code when the first frame is not a `hello`.
pub const CLOSE_EXPECTED_HELLO: u16 = 4002;
/// Close code for a rejected `auth_token`.
pub const CLOSE_AUTH_FAILED: u16 = 4003;

/// Session timing knobs; tests shrink these.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// `hello` must arrive within this window
    pub handshake: Duration,
    /// Ping cadence once authenticated
    pub heartbeat: Duration,
    /// Pong must arrive this soon after a ping
    pub pong: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(5),
            heartbeat: Duration::from_secs(30),
            pong: Duration::from_secs(10),
        }
    }
}

/// Accept gateway connections until the listener is torn down.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket accept failed");
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => handle_connection(ws, state).await,
                Err(e) => tracing::warn!(peer = %peer, error = %e, "WebSocket upgrade failed"),
            }
        });
    }
}

async fn handle_connection(ws: WebSocketStream<TcpStream>, state: Arc<AppState>) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: the only holder of the sink. Stops after forwarding a
    // close frame so teardown frames always reach the wire.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // ── Handshake ────────────────────────────────────────────────────────
    let hello = tokio::time::timeout(state.timeouts.handshake, stream.next()).await;
    let gateway_id = match hello {
        Err(_) => {
            send_close(&tx, CLOSE_AUTH_TIMEOUT, "Authentication timeout");
            let _ = writer.await;
            return;
        }
        Ok(None) | Ok(Some(Err(_))) => {
            drop(tx);
            let _ = writer.await;
            return;
        }
        Ok(Some(Ok(Message::Text(text)))) => match Frame::decode(&text) {
            Ok(Frame::Hello {
                gateway_id,
                auth_token,
            }) => {
                if !constant_time_eq(&auth_token, &state.auth_secret) {
                    tracing::warn!(gateway_id = %gateway_id, "gateway auth failed");
                    send_close(&tx, CLOSE_AUTH_FAILED, "Authentication failed");
                    let _ = writer.await;
                    return;
                }
                gateway_id
            }
            Ok(frame) => {
                tracing::warn!(frame_type = frame.type_str(), "first frame was not hello");
                send_close(&tx, CLOSE_EXPECTED_HELLO, "Expected hello");
                let _ = writer.await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable handshake frame");
                send_close(&tx, CLOSE_EXPECTED_HELLO, "Expected hello");
                let _ = writer.await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            send_close(&tx, CLOSE_EXPECTED_HELLO, "Expected hello");
            let _ = writer.await;
            return;
        }
    };

    let conn_seq = state.registry.next_seq();
    let handle = Arc::new(GatewayHandle::new(gateway_id.clone(), conn_seq, tx.clone()));
    state.registry.register(handle.clone());
    handle.send_frame(&Frame::Ack { id: "hello".into() });
    tracing::info!(gateway_id = %gateway_id, conn_seq, "gateway authenticated");

    // ── Authenticated frame pump + heartbeat ─────────────────────────────
    let mut ping_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + state.timeouts.heartbeat,
        state.timeouts.heartbeat,
    );
    let mut awaiting_pong = false;
    let pong_deadline = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if !handle.send_message(Message::Ping(Vec::new())) {
                    break;
                }
                awaiting_pong = true;
                pong_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + state.timeouts.pong);
            }
            _ = &mut pong_deadline, if awaiting_pong => {
                tracing::warn!(gateway_id = %gateway_id, "heartbeat timeout, terminating");
                send_close(&tx, 1000, "Heartbeat timeout");
                break;
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &gateway_id, &handle, &state).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        handle.send_message(Message::Pong(payload));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(gateway_id = %gateway_id, "gateway disconnected");
                        break;
                    }
                    Some(Ok(other)) => {
                        tracing::debug!(gateway_id = %gateway_id, "ignoring non-text message: {other:?}");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(gateway_id = %gateway_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    // Only unregister if this connection is still the registered one; a
    // replacement must not be raced out by our teardown
    state.registry.remove(&gateway_id, conn_seq);
    drop(tx);
    let _ = writer.await;
}

async fn handle_frame(
    text: &str,
    gateway_id: &str,
    handle: &Arc<GatewayHandle>,
    state: &Arc<AppState>,
) {
    match Frame::decode(text) {
        Ok(Frame::Reply {
            id,
            external_user_id,
            content,
        }) => {
            let reply = state.reply.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = reply.deliver(&external_user_id, &content).await {
                    tracing::error!(reply_id = %id, error = %e, "reply delivery failed");
                    handle.send_frame(&Frame::Error {
                        message: format!("reply {id} failed: {e}"),
                    });
                }
            });
        }
        Ok(Frame::CreateBinding {
            gateway_id: target,
        }) => {
            let token = state.bindings.create_pending(&target, PENDING_TTL);
            match state.kf.customer_service_url(&token).await {
                Ok(url) => {
                    handle.send_frame(&Frame::CreateBindingAck {
                        token,
                        customer_service_url: url,
                    });
                }
                Err(e) => {
                    tracing::error!(gateway_id = %target, error = %e, "customer-service URL unavailable");
                    handle.send_frame(&Frame::Error {
                        message: format!("create_binding failed: {e}"),
                    });
                }
            }
        }
        Ok(Frame::UnbindAll {
            gateway_id: target,
        }) => {
            let removed = state.bindings.unbind_all(&target);
            tracing::info!(gateway_id = %target, removed, "bindings removed");
        }
        Ok(frame) => {
            tracing::debug!(
                gateway_id = %gateway_id,
                frame_type = frame.type_str(),
                "ignoring unexpected frame"
            );
        }
        // UnknownFrameType and MalformedFrame both answer with an error
        // frame and keep the connection
        Err(e) => {
            tracing::warn!(gateway_id = %gateway_id, error = %e, "bad frame");
            handle.send_frame(&Frame::Error {
                message: e.to_string(),
            });
        }
    }
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) {
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    })));
}
