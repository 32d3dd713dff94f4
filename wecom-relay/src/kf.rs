//! WeCom customer-service API client.
//!
//! Wraps the three `kf/` endpoints the relay needs: `send_msg` for outbound
//! text, `sync_msg` for draining message batches after a webhook, and
//! `add_contact_way` for provisioning the customer-service link.
//!
//! ## API Documentation
//! - https://developer.work.weixin.qq.com/document/path/94677 (sync_msg)
//! - https://developer.work.weixin.qq.com/document/path/94686 (send_msg)

use crate::envelope::SyncMessage;
use crate::reply::utf8_prefix;
use crate::token::AccessTokenCache;
use async_trait::async_trait;
use relay_common::WeComConfig;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;

const WECOM_API_BASE: &str = "https://qyapi.weixin.qq.com/cgi-bin";

/// Per-message content cap, UTF-8 bytes.
pub const SEND_MSG_LIMIT: usize = 2048;

/// WeCom API failures.
#[derive(Debug, thiserror::Error)]
pub enum KfError {
    /// Non-zero `errcode` from the API
    #[error("WeCom API error {code}: {message}")]
    Upstream { code: i64, message: String },

    /// HTTP-level failure (non-2xx, I/O, timeout)
    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Deserialize)]
struct SendMsgResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    msgid: String,
}

#[derive(Debug, Deserialize)]
struct SyncMsgResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    next_cursor: String,
    #[serde(default)]
    has_more: u8,
    #[serde(default)]
    msg_list: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ContactWayResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    url: String,
}

/// Outbound text seam, so the reply engine can be exercised without the
/// real API behind it.
#[async_trait]
pub trait TextSender: Send + Sync {
    /// Send one text message to a user; returns the `msgid` (may be empty).
    async fn send_text(&self, to_user: &str, content: &str) -> Result<String, KfError>;
}

/// HTTP client for the customer-service API.
pub struct KfClient {
    client: reqwest::Client,
    api_base: String,
    tokens: AccessTokenCache,
    open_kfid: String,
    kf_url: Option<String>,
    /// Link provisioned via `add_contact_way`, fetched once
    contact_url: Mutex<Option<String>>,
}

fn shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

impl KfClient {
    pub fn new(wecom: &WeComConfig) -> Self {
        Self::with_api_base(wecom, WECOM_API_BASE)
    }

    /// Construct against an alternate API base (tests point this at a mock).
    pub fn with_api_base(wecom: &WeComConfig, api_base: &str) -> Self {
        let client = shared_client();
        Self {
            client: client.clone(),
            api_base: api_base.to_string(),
            tokens: AccessTokenCache::new(
                client,
                api_base,
                wecom.corp_id.clone(),
                wecom.app_secret.clone(),
            ),
            open_kfid: wecom.open_kfid.clone(),
            kf_url: wecom.kf_url.clone(),
            contact_url: Mutex::new(None),
        }
    }

    /// Drain every pending message for this customer-service account.
    ///
    /// `event_token` is the short-lived `Token` carried by the webhook
    /// notification. The cursor is walked until the API reports no more;
    /// an upstream error aborts the walk but keeps what was already drained
    /// out of scope for retry (WeCom re-delivers on its side).
    pub async fn sync_messages(&self, event_token: &str) -> Result<Vec<SyncMessage>, KfError> {
        let access_token = self.tokens.get().await?;
        let mut messages = Vec::new();
        let mut cursor = String::new();

        loop {
            let url = format!("{}/kf/sync_msg?access_token={access_token}", self.api_base);
            let body = json!({
                "cursor": cursor,
                "token": event_token,
                "open_kfid": self.open_kfid,
            });

            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| KfError::Transport(format!("sync_msg request failed: {e}")))?;
            if !resp.status().is_success() {
                return Err(KfError::Transport(format!(
                    "sync_msg returned HTTP {}",
                    resp.status()
                )));
            }

            let batch: SyncMsgResponse = resp
                .json()
                .await
                .map_err(|e| KfError::Transport(format!("sync_msg body: {e}")))?;
            if batch.errcode != 0 {
                return Err(KfError::Upstream {
                    code: batch.errcode,
                    message: batch.errmsg,
                });
            }

            let empty = batch.msg_list.is_empty();
            messages.extend(batch.msg_list.iter().map(SyncMessage::parse));

            if batch.has_more == 0 || empty {
                break;
            }
            cursor = batch.next_cursor;
        }

        tracing::debug!(count = messages.len(), "sync_msg drained");
        Ok(messages)
    }

    /// The customer-service link for a pending token.
    ///
    /// Configured `WECOM_KF_URL` wins; otherwise one link is provisioned
    /// via `add_contact_way` and cached for the process lifetime. WeCom
    /// hands the appended `scene_param` back on `enter_session`.
    pub async fn customer_service_url(&self, pending_token: &str) -> Result<String, KfError> {
        if let Some(base) = &self.kf_url {
            return Ok(format!("{base}?scene_param={pending_token}"));
        }

        let mut cached = self.contact_url.lock().await;
        let base = match cached.as_ref() {
            Some(url) => url.clone(),
            None => {
                let url = self.add_contact_way().await?;
                *cached = Some(url.clone());
                url
            }
        };
        Ok(format!("{base}?scene_param={pending_token}"))
    }

    async fn add_contact_way(&self) -> Result<String, KfError> {
        let access_token = self.tokens.get().await?;
        let url = format!(
            "{}/kf/add_contact_way?access_token={access_token}",
            self.api_base
        );
        let body = json!({ "open_kfid": self.open_kfid, "scene": "relay" });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| KfError::Transport(format!("add_contact_way request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(KfError::Transport(format!(
                "add_contact_way returned HTTP {}",
                resp.status()
            )));
        }

        let data: ContactWayResponse = resp
            .json()
            .await
            .map_err(|e| KfError::Transport(format!("add_contact_way body: {e}")))?;
        if data.errcode != 0 {
            return Err(KfError::Upstream {
                code: data.errcode,
                message: data.errmsg,
            });
        }
        Ok(data.url)
    }
}

#[async_trait]
impl TextSender for KfClient {
    async fn send_text(&self, to_user: &str, content: &str) -> Result<String, KfError> {
        let content = if content.len() > SEND_MSG_LIMIT {
            // Longest char-boundary prefix that leaves room for the ellipsis
            let truncated = utf8_prefix(content, SEND_MSG_LIMIT - 3);
            tracing::warn!(
                to_user,
                original_bytes = content.len(),
                "send_msg content over {SEND_MSG_LIMIT} bytes, truncated"
            );
            format!("{truncated}...")
        } else {
            content.to_string()
        };

        let access_token = self.tokens.get().await?;
        let url = format!("{}/kf/send_msg?access_token={access_token}", self.api_base);
        let body = json!({
            "touser": to_user,
            "open_kfid": self.open_kfid,
            "msgtype": "text",
            "text": { "content": content },
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| KfError::Transport(format!("send_msg request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(KfError::Transport(format!(
                "send_msg returned HTTP {}",
                resp.status()
            )));
        }

        let data: SendMsgResponse = resp
            .json()
            .await
            .map_err(|e| KfError::Transport(format!("send_msg body: {e}")))?;
        if data.errcode != 0 {
            return Err(KfError::Upstream {
                code: data.errcode,
                message: data.errmsg,
            });
        }
        Ok(data.msgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageBody;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn test_config(kf_url: Option<String>) -> WeComConfig {
        WeComConfig {
            corp_id: "ww-corp".into(),
            app_secret: "app-secret".into(),
            callback_token: "cb-token".into(),
            encoding_aes_key: "a".repeat(43),
            open_kfid: "kfc001".into(),
            kf_url,
        }
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "errmsg": "ok",
                "access_token": "AT", "expires_in": 7200
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn send_text_posts_expected_body() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/kf/send_msg"))
            .and(query_param("access_token", "AT"))
            .and(body_partial_json(serde_json::json!({
                "touser": "u1",
                "open_kfid": "kfc001",
                "msgtype": "text",
                "text": { "content": "hello" },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "errmsg": "ok", "msgid": "MSG-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = KfClient::with_api_base(&test_config(None), &server.uri());
        assert_eq!(client.send_text("u1", "hello").await.unwrap(), "MSG-1");
    }

    #[tokio::test]
    async fn send_text_truncates_oversized_content() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/kf/send_msg"))
            .respond_with(move |req: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let content = body["text"]["content"].as_str().unwrap();
                assert!(content.len() <= SEND_MSG_LIMIT);
                assert!(content.ends_with("..."));
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "errcode": 0, "errmsg": "ok", "msgid": "MSG-T"
                }))
            })
            .mount(&server)
            .await;

        let client = KfClient::with_api_base(&test_config(None), &server.uri());
        // Multibyte payload well over the cap; truncation must not split a
        // code point
        let oversized = "微信客服".repeat(400);
        client.send_text("u1", &oversized).await.unwrap();
    }

    #[tokio::test]
    async fn send_text_surfaces_upstream_error() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/kf/send_msg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 95001, "errmsg": "out of the 48h window"
            })))
            .mount(&server)
            .await;

        let client = KfClient::with_api_base(&test_config(None), &server.uri());
        match client.send_text("u1", "hi").await {
            Err(KfError::Upstream { code, .. }) => assert_eq!(code, 95001),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_messages_walks_cursor_to_exhaustion() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        Mock::given(method("POST"))
            .and(path("/kf/sync_msg"))
            .and(body_partial_json(serde_json::json!({ "cursor": "" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "errmsg": "ok",
                "next_cursor": "C1", "has_more": 1,
                "msg_list": [
                    { "msgtype": "text", "external_userid": "u1", "origin": 3,
                      "send_time": 1, "text": { "content": "first" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/kf/sync_msg"))
            .and(body_partial_json(serde_json::json!({ "cursor": "C1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "errmsg": "ok",
                "next_cursor": "C2", "has_more": 0,
                "msg_list": [
                    { "msgtype": "text", "external_userid": "u1", "origin": 3,
                      "send_time": 2, "text": { "content": "second" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = KfClient::with_api_base(&test_config(None), &server.uri());
        let messages = client.sync_messages("EVT").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[1].body,
            MessageBody::Text { ref content } if content == "second"
        ));
    }

    #[tokio::test]
    async fn sync_messages_fails_fast_on_upstream_error() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/kf/sync_msg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 40014, "errmsg": "invalid access_token"
            })))
            .mount(&server)
            .await;

        let client = KfClient::with_api_base(&test_config(None), &server.uri());
        assert!(matches!(
            client.sync_messages("EVT").await,
            Err(KfError::Upstream { code: 40014, .. })
        ));
    }

    #[tokio::test]
    async fn customer_service_url_prefers_configured_base() {
        let server = MockServer::start().await;
        let client = KfClient::with_api_base(
            &test_config(Some("https://work.weixin.qq.com/kf/kfc001".into())),
            &server.uri(),
        );
        let url = client.customer_service_url("T1").await.unwrap();
        assert_eq!(url, "https://work.weixin.qq.com/kf/kfc001?scene_param=T1");
    }

    #[tokio::test]
    async fn customer_service_url_provisions_once() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/kf/add_contact_way"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "errmsg": "ok",
                "url": "https://work.weixin.qq.com/kf/kfcPROV"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = KfClient::with_api_base(&test_config(None), &server.uri());
        let first = client.customer_service_url("T1").await.unwrap();
        let second = client.customer_service_url("T2").await.unwrap();
        assert_eq!(first, "https://work.weixin.qq.com/kf/kfcPROV?scene_param=T1");
        assert_eq!(second, "https://work.weixin.qq.com/kf/kfcPROV?scene_param=T2");
    }
}
