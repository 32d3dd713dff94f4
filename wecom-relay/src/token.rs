//! WeCom access-token cache.
//!
//! Tokens live ~2 hours; this cache refreshes 10 minutes ahead of expiry
//! and serializes refreshes behind one lock, so N concurrent callers
//! produce exactly one upstream fetch.

use crate::kf::KfError;
use serde::Deserialize;
use tokio::sync::Mutex;

/// Refresh this long before the reported expiry.
const REFRESH_MARGIN_MILLIS: i64 = 10 * 60 * 1000;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    access_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

impl CachedToken {
    fn is_fresh(&self, now: i64) -> bool {
        now < self.expires_at - REFRESH_MARGIN_MILLIS
    }
}

/// Process-wide access-token state.
pub struct AccessTokenCache {
    client: reqwest::Client,
    api_base: String,
    corp_id: String,
    secret: String,
    // Held across the refresh call: late arrivals queue here and find the
    // fresh token on re-check instead of fetching again
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenCache {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        corp_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            corp_id: corp_id.into(),
            secret: secret.into(),
            cached: Mutex::new(None),
        }
    }

    /// Get a valid access token, refreshing if it expires within 10 minutes.
    pub async fn get(&self) -> Result<String, KfError> {
        let mut cached = self.cached.lock().await;

        let now = chrono::Utc::now().timestamp_millis();
        if let Some(entry) = cached.as_ref() {
            if entry.is_fresh(now) {
                return Ok(entry.token.clone());
            }
        }

        let token = self.refresh().await?;
        *cached = Some(token.clone());
        Ok(token.token)
    }

    async fn refresh(&self) -> Result<CachedToken, KfError> {
        let url = format!(
            "{}/gettoken?corpid={}&corpsecret={}",
            self.api_base, self.corp_id, self.secret
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KfError::Transport(format!("gettoken request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(KfError::Transport(format!(
                "gettoken returned HTTP {}",
                resp.status()
            )));
        }

        let data: TokenResponse = resp
            .json()
            .await
            .map_err(|e| KfError::Transport(format!("gettoken body: {e}")))?;

        if data.errcode != 0 {
            return Err(KfError::Upstream {
                code: data.errcode,
                message: data.errmsg,
            });
        }

        let token = data.access_token.ok_or_else(|| KfError::Upstream {
            code: 0,
            message: "gettoken response carried no access_token".into(),
        })?;
        let expires_in = data.expires_in.unwrap_or(7200);

        tracing::debug!(expires_in, "WeCom access token refreshed");
        Ok(CachedToken {
            token,
            expires_at: chrono::Utc::now().timestamp_millis() + expires_in * 1000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cache_for(server: &MockServer) -> AccessTokenCache {
        AccessTokenCache::new(
            reqwest::Client::new(),
            server.uri(),
            "ww-corp",
            "app-secret",
        )
    }

    #[tokio::test]
    async fn fetches_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "errmsg": "ok",
                "access_token": "TOKEN-1", "expires_in": 7200
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        assert_eq!(cache.get().await.unwrap(), "TOKEN-1");
        // Second call is served from cache; the mock would fail on a 2nd hit
        assert_eq!(cache.get().await.unwrap(), "TOKEN-1");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_millis(50))
                    .set_body_json(serde_json::json!({
                        "errcode": 0, "errmsg": "ok",
                        "access_token": "TOKEN-SF", "expires_in": 7200
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(cache_for(&server));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.get().await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "TOKEN-SF");
        }
    }

    #[tokio::test]
    async fn upstream_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 40013, "errmsg": "invalid corpid"
            })))
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        match cache.get().await {
            Err(KfError::Upstream { code, .. }) => assert_eq!(code, 40013),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_does_not_poison_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        assert!(matches!(cache.get().await, Err(KfError::Transport(_))));

        // Swap in a healthy responder; the next get retries the fetch
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0, "errmsg": "ok",
                "access_token": "TOKEN-2", "expires_in": 7200
            })))
            .mount(&server)
            .await;
        assert_eq!(cache.get().await.unwrap(), "TOKEN-2");
    }
}
