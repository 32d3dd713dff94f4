//! Configuration for the WeCom relay.
//!
//! The relay is configured entirely through environment variables; there is
//! no config file. Missing required variables abort startup.
//!
//! # Environment Variable Mapping
//!
//! ## Listeners
//! - `HTTP_PORT` → callback HTTP server port (default 8080)
//! - `WS_PORT` → gateway WebSocket port (default 8081)
//! - `BIND_ADDRESS` → bind address for both listeners (default 127.0.0.1)
//!
//! ## Auth
//! - `RELAY_AUTH_SECRET` → shared secret for gateway `hello` frames and
//!   the binding HTTP endpoints
//!
//! ## WeCom tenant
//! - `WECOM_CORPID`, `WECOM_APP_SECRET`, `WECOM_TOKEN`,
//!   `WECOM_ENCODING_AES_KEY`, `WECOM_OPEN_KFID`
//! - `WECOM_KF_URL` → optional customer-service link base; when absent the
//!   relay provisions one via `kf/add_contact_way`
//!
//! ## Misc
//! - `LOCALE` → `zh` | `en`, welcome-message language (default zh)
//! - `LOG_LEVEL`, `LOG_FORMAT` → tracing filter and output format

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Welcome-message language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Zh,
    En,
}

impl Locale {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Zh => "zh",
            Self::En => "en",
        }
    }
}

impl std::str::FromStr for Locale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zh" => Ok(Self::Zh),
            "en" => Ok(Self::En),
            other => Err(Error::Config(format!(
                "Unsupported LOCALE '{other}' (expected 'zh' or 'en')"
            ))),
        }
    }
}

/// WeCom tenant credentials.
#[derive(Debug, Clone)]
pub struct WeComConfig {
    /// Enterprise ID (`corpid`)
    pub corp_id: String,
    /// Customer-service app secret, exchanged for access tokens
    pub app_secret: String,
    /// Callback verification token
    pub callback_token: String,
    /// 43-char EncodingAESKey from the admin console
    pub encoding_aes_key: String,
    /// Customer-service account id (`open_kfid`)
    pub open_kfid: String,
    /// Customer-service link base; provisioned at runtime when absent
    pub kf_url: Option<String>,
}

/// Relay configuration, fully resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address shared by the HTTP and WebSocket listeners
    pub bind_address: String,
    /// Callback HTTP server port
    pub http_port: u16,
    /// Gateway WebSocket port
    pub ws_port: u16,
    /// Shared secret validated against `hello.auth_token` and the
    /// `Authorization` header of the binding endpoints
    pub auth_secret: String,
    /// WeCom tenant credentials
    pub wecom: WeComConfig,
    /// Welcome-message language
    pub locale: Locale,
    /// Tracing filter (e.g. "info", "wecom_relay=debug")
    pub log_level: String,
    /// "pretty" or "json"
    pub log_format: String,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Required variables that are missing or empty produce a
    /// [`Error::Config`]; callers should treat that as fatal.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            bind_address: env_or("BIND_ADDRESS", "127.0.0.1"),
            http_port: env_port("HTTP_PORT", 8080)?,
            ws_port: env_port("WS_PORT", 8081)?,
            auth_secret: required("RELAY_AUTH_SECRET")?,
            wecom: WeComConfig {
                corp_id: required("WECOM_CORPID")?,
                app_secret: required("WECOM_APP_SECRET")?,
                callback_token: required("WECOM_TOKEN")?,
                encoding_aes_key: required("WECOM_ENCODING_AES_KEY")?,
                open_kfid: required("WECOM_OPEN_KFID")?,
                kf_url: env::var("WECOM_KF_URL").ok().filter(|v| !v.is_empty()),
            },
            locale: env_or("LOCALE", "zh").parse()?,
            log_level: env_or("LOG_LEVEL", "info"),
            log_format: env_or("LOG_FORMAT", "pretty"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks beyond presence.
    pub fn validate(&self) -> Result<()> {
        if self.wecom.encoding_aes_key.len() != 43 {
            return Err(Error::Config(format!(
                "WECOM_ENCODING_AES_KEY must be 43 characters, got {}",
                self.wecom.encoding_aes_key.len()
            )));
        }
        if self.http_port == self.ws_port {
            return Err(Error::Config(format!(
                "HTTP_PORT and WS_PORT must differ (both {})",
                self.http_port
            )));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn required(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("Missing required environment variable {key}")))
}

fn env_port(key: &str, default: u16) -> Result<u16> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("Invalid port in {key}: '{v}'"))),
        _ => Ok(default),
    }
}
