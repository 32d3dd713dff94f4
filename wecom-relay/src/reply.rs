//! Outbound reply engine.
//!
//! Gateway replies are free-form text; WeCom caps one message at 2048 UTF-8
//! bytes and a conversation window at a handful of proactive messages. This
//! module chunks replies on natural boundaries, caps them at five messages,
//! and sends the chunks of one reply strictly in order.

use crate::kf::{KfError, TextSender, SEND_MSG_LIMIT};
use std::sync::Arc;

/// WeChat 48-hour-window cap: at most this many messages per reply.
pub const MAX_CHUNKS_PER_REPLY: usize = 5;

/// Sentence-ending characters worth breaking after.
const SENTENCE_ENDINGS: [char; 7] = ['.', '!', '?', '。', '！', '？', '\n'];

/// Longest prefix of `s` that fits in `max_bytes` without splitting a code
/// point.
pub(crate) fn utf8_prefix(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut idx = max_bytes;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}

/// Split `content` into chunks of at most `max_bytes` UTF-8 bytes.
///
/// Boundary preference, per chunk: a sentence ending inside the last
/// quarter of the allowed prefix, else the last space, else a hard cut on
/// the last char boundary. Only whitespace at a cut is consumed.
pub fn split_message(content: &str, max_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = content;

    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            let tail = remaining.trim();
            if !tail.is_empty() {
                chunks.push(tail.to_string());
            }
            break;
        }

        let prefix = utf8_prefix(remaining, max_bytes);
        let cut = preferred_cut(prefix);

        let chunk = remaining[..cut].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = remaining[cut..].trim_start();
    }

    chunks
}

/// Pick the cut position inside a maximal prefix.
fn preferred_cut(prefix: &str) -> usize {
    // Sentence endings only count in the last 25% of the prefix, so short
    // fragments near the start don't produce tiny chunks
    let window_start = prefix.len() - prefix.len() / 4;
    if let Some((idx, c)) = prefix
        .char_indices()
        .filter(|(_, c)| SENTENCE_ENDINGS.contains(c))
        .last()
    {
        let end = idx + c.len_utf8();
        if end >= window_start {
            return end;
        }
    }

    if let Some(idx) = prefix.rfind(' ') {
        if idx > 0 {
            return idx + 1;
        }
    }

    prefix.len()
}

/// Chunks, caps, and sends one gateway reply.
pub struct ReplyEngine {
    sender: Arc<dyn TextSender>,
}

impl ReplyEngine {
    pub fn new(sender: Arc<dyn TextSender>) -> Self {
        Self { sender }
    }

    /// Deliver `content` to `external_user_id`.
    ///
    /// Chunks are sent serially; a failed chunk is logged and the rest are
    /// still attempted. The first failure is returned so the session can
    /// surface it to the gateway.
    pub async fn deliver(&self, external_user_id: &str, content: &str) -> Result<(), KfError> {
        let mut chunks = split_message(content, SEND_MSG_LIMIT);
        if chunks.len() > MAX_CHUNKS_PER_REPLY {
            tracing::warn!(
                external_user_id,
                chunks = chunks.len(),
                dropped = chunks.len() - MAX_CHUNKS_PER_REPLY,
                "reply exceeds the per-window message cap, discarding overflow"
            );
            chunks.truncate(MAX_CHUNKS_PER_REPLY);
        }

        let mut first_error = None;
        for (i, chunk) in chunks.iter().enumerate() {
            match self.sender.send_text(external_user_id, chunk).await {
                Ok(msgid) => {
                    tracing::debug!(external_user_id, chunk = i, %msgid, "reply chunk sent");
                }
                Err(e) => {
                    tracing::error!(external_user_id, chunk = i, error = %e, "reply chunk failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
