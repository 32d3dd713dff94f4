//! Gateway wire protocol frames.
//!
//! Frames are UTF-8 JSON text with a mandatory `type` discriminator. The
//! set is closed: unknown discriminators are rejected at decode time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame decode failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Unknown frame type '{0}'")]
    UnknownFrameType(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

/// All frames exchanged between gateways and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// G→R: authenticate; must be the first frame within the handshake window
    Hello {
        gateway_id: String,
        auth_token: String,
    },
    /// R→G: confirms a received frame; `id: "hello"` after successful auth
    Ack { id: String },
    /// R→G: a user message routed to this gateway
    Inbound {
        id: String,
        external_user_id: String,
        msg_type: String,
        content: String,
        timestamp: i64,
    },
    /// G→R: text reply to a user
    Reply {
        id: String,
        external_user_id: String,
        content: String,
    },
    /// R→G: fatal or per-frame error
    Error { message: String },
    /// G→R: request a pending-token binding flow
    CreateBinding { gateway_id: String },
    /// R→G: response to `create_binding`
    CreateBindingAck {
        token: String,
        customer_service_url: String,
    },
    /// G→R: remove all bindings for this gateway
    UnbindAll { gateway_id: String },
    /// R→G: a pending binding completed
    BindingResolved {
        external_user_id: String,
        gateway_id: String,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "hello",
    "ack",
    "inbound",
    "reply",
    "error",
    "create_binding",
    "create_binding_ack",
    "unbind_all",
    "binding_resolved",
];

impl Frame {
    /// Decode a text frame.
    ///
    /// Distinguishes an out-of-protocol discriminator
    /// ([`FrameError::UnknownFrameType`]) from a payload that fails to
    /// parse at all ([`FrameError::MalformedFrame`]).
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FrameError::MalformedFrame(e.to_string()))?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FrameError::MalformedFrame("missing \"type\" field".into()))?;
        if !KNOWN_TYPES.contains(&frame_type) {
            return Err(FrameError::UnknownFrameType(frame_type.to_string()));
        }
        serde_json::from_value(value).map_err(|e| FrameError::MalformedFrame(e.to_string()))
    }

    /// Encode to JSON text.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("Frame is always JSON-serializable")
    }

    /// Discriminator string, for logging.
    pub const fn type_str(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Ack { .. } => "ack",
            Self::Inbound { .. } => "inbound",
            Self::Reply { .. } => "reply",
            Self::Error { .. } => "error",
            Self::CreateBinding { .. } => "create_binding",
            Self::CreateBindingAck { .. } => "create_binding_ack",
            Self::UnbindAll { .. } => "unbind_all",
            Self::BindingResolved { .. } => "binding_resolved",
        }
    }
}
