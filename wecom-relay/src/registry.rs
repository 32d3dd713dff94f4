//! Gateway connection registry.
//!
//! Holds the only long-lived reference to each authenticated gateway
//! socket, via a handle whose unbounded sender feeds the connection's
//! writer task. All operations take one guard and never perform socket I/O
//! while holding it; enqueueing on the handle is non-blocking.

use crate::frame::Frame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Close reason used when a gateway reconnects over a live session.
pub const REPLACED_REASON: &str = "Replaced by new connection";

/// One authenticated gateway connection.
///
/// `conn_seq` disambiguates successive connections of the same gateway id:
/// removal only happens when the registered sequence still matches, so a
/// replaced connection's teardown cannot race out its replacement.
pub struct GatewayHandle {
    pub gateway_id: String,
    pub conn_seq: u64,
    sender: mpsc::UnboundedSender<Message>,
}

impl GatewayHandle {
    pub fn new(
        gateway_id: impl Into<String>,
        conn_seq: u64,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            conn_seq,
            sender,
        }
    }

    /// Enqueue a protocol frame. Returns `false` when the writer is gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        self.sender
            .send(Message::Text(frame.encode().into()))
            .is_ok()
    }

    /// Enqueue a raw WebSocket message (ping/pong/close).
    pub fn send_message(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Enqueue a close frame.
    pub fn close(&self, code: CloseCode, reason: &str) {
        let _ = self.sender.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }
}

/// Registry of authenticated gateway connections, keyed by gateway id.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<String, Arc<GatewayHandle>>>,
    seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert `handle`, replacing any existing connection for the same
    /// gateway id. The displaced connection is closed with code 1000 after
    /// the guard is released.
    pub fn register(&self, handle: Arc<GatewayHandle>) {
        let gateway_id = handle.gateway_id.clone();
        let replaced = {
            let mut inner = self.inner.lock().expect("registry poisoned");
            inner.insert(gateway_id.clone(), handle)
        };

        if let Some(old) = replaced {
            tracing::info!(gateway_id = %gateway_id, "gateway reconnected, closing previous connection");
            old.close(CloseCode::Normal, REPLACED_REASON);
        }
    }

    /// Remove a connection, but only if `conn_seq` still matches the
    /// registered entry.
    pub fn remove(&self, gateway_id: &str, conn_seq: u64) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        if inner
            .get(gateway_id)
            .is_some_and(|h| h.conn_seq == conn_seq)
        {
            inner.remove(gateway_id);
        }
    }

    /// Look up the live connection for a gateway.
    pub fn get(&self, gateway_id: &str) -> Option<Arc<GatewayHandle>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .get(gateway_id)
            .cloned()
    }

    /// Number of connected gateways.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered connection (shutdown path).
    pub fn close_all(&self, reason: &str) {
        let handles: Vec<_> = {
            let mut inner = self.inner.lock().expect("registry poisoned");
            inner.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.close(CloseCode::Normal, reason);
        }
    }
}
