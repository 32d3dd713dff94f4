//! Callback envelope and `sync_msg` message parsing.
//!
//! WeCom delivers webhook notifications as small XML envelopes whose
//! `<Encrypt>` field carries the AES payload, and message batches as JSON
//! from `kf/sync_msg`. Both are parsed here into typed values.

use serde::Deserialize;
use serde_json::Value;

/// Envelope parsing failures.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Missing <Encrypt> field in callback XML")]
    NoEncryptField,
}

/// The outer (or decrypted inner) XML callback envelope.
///
/// Missing fields become empty strings; the signature check on the raw
/// `<Encrypt>` value is the authoritative gate, not field presence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackEnvelope {
    pub to_user_name: String,
    pub create_time: i64,
    pub msg_type: String,
    pub event: String,
    pub token: String,
    pub open_kfid: String,
    pub encrypt: String,
}

impl CallbackEnvelope {
    /// Parse a callback envelope, accepting both CDATA-wrapped and bare
    /// element values.
    pub fn parse(xml: &str) -> Self {
        Self {
            to_user_name: extract_tag(xml, "ToUserName").unwrap_or_default(),
            create_time: extract_tag(xml, "CreateTime")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            msg_type: extract_tag(xml, "MsgType").unwrap_or_default(),
            event: extract_tag(xml, "Event").unwrap_or_default(),
            token: extract_tag(xml, "Token").unwrap_or_default(),
            open_kfid: extract_tag(xml, "OpenKfId").unwrap_or_default(),
            encrypt: extract_tag(xml, "Encrypt").unwrap_or_default(),
        }
    }
}

/// Pull the `<Encrypt>` value out of a callback body.
pub fn extract_encrypt(xml: &str) -> Result<String, EnvelopeError> {
    extract_tag(xml, "Encrypt").ok_or(EnvelopeError::NoEncryptField)
}

/// Extract the text content of an XML tag, stripping CDATA when present.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    let content = &xml[start..end];

    let content = if content.starts_with("<![CDATA[") && content.ends_with("]]>") {
        &content[9..content.len() - 3]
    } else {
        content
    };
    Some(content.to_string())
}

// ============================================================================
// sync_msg entries
// ============================================================================

/// Message origin value for end-customer messages; everything else is
/// operator or system traffic and is not relayed.
pub const ORIGIN_CUSTOMER: u32 = 3;

/// One entry from a `kf/sync_msg` batch.
#[derive(Debug, Clone)]
pub struct SyncMessage {
    pub msgid: String,
    pub external_userid: String,
    pub open_kfid: String,
    pub send_time: i64,
    /// 3 = customer, 4 = system, 5 = servicer; absent on some events
    pub origin: Option<u32>,
    pub body: MessageBody,
}

/// Typed message body, keyed by `msgtype`.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Text { content: String },
    Image { media_id: String },
    Voice { media_id: String },
    Event(EventBody),
    /// Unknown `msgtype`; kept verbatim and routed with empty content
    Unknown { raw: Value },
}

/// Payload of an event entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventBody {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub scene_param: String,
    #[serde(default)]
    pub welcome_code: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawSyncMessage {
    #[serde(default)]
    msgtype: String,
    #[serde(default)]
    msgid: String,
    #[serde(default)]
    external_userid: String,
    #[serde(default)]
    open_kfid: String,
    #[serde(default)]
    send_time: i64,
    #[serde(default)]
    origin: Option<u32>,
    #[serde(default)]
    text: Option<TextPayload>,
    #[serde(default)]
    image: Option<MediaPayload>,
    #[serde(default)]
    voice: Option<MediaPayload>,
    #[serde(default)]
    event: Option<EventBody>,
}

#[derive(Debug, Default, Deserialize)]
struct TextPayload {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct MediaPayload {
    #[serde(default)]
    media_id: String,
}

impl SyncMessage {
    /// Parse one `msg_list` entry. Unknown `msgtype` values are preserved
    /// rather than rejected; downstream routes them as `"unknown"`.
    pub fn parse(value: &Value) -> Self {
        let raw: RawSyncMessage = serde_json::from_value(value.clone()).unwrap_or_default();

        let body = match raw.msgtype.as_str() {
            "text" => MessageBody::Text {
                content: raw.text.unwrap_or_default().content,
            },
            "image" => MessageBody::Image {
                media_id: raw.image.unwrap_or_default().media_id,
            },
            "voice" => MessageBody::Voice {
                media_id: raw.voice.unwrap_or_default().media_id,
            },
            "event" => MessageBody::Event(raw.event.unwrap_or_default()),
            _ => MessageBody::Unknown { raw: value.clone() },
        };

        Self {
            msgid: raw.msgid,
            external_userid: raw.external_userid,
            open_kfid: raw.open_kfid,
            send_time: raw.send_time,
            origin: raw.origin,
            body,
        }
    }

    /// `true` when the message came from the end customer (or carries no
    /// origin at all, as events do).
    pub fn is_customer(&self) -> bool {
        self.origin.map_or(true, |o| o == ORIGIN_CUSTOMER)
    }
}
