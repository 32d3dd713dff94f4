//! WeCom Relay - bridges WeCom customer-service accounts and gateway
//! processes.
//!
//! An end user chats with a corporate customer-service account; WeCom
//! delivers encrypted event notifications to this relay's HTTP callback.
//! The relay drains the pending messages, resolves the user→gateway
//! binding, and forwards each message over a long-lived WebSocket. Gateway
//! replies travel the other way, chunked under WeCom's per-message limit.
//!
//! ```text
//! WeCom HTTP ──► crypto ──► envelope ──► kf (sync pump) ──► dispatch ──► gateway WS
//! gateway WS ──► frame ──► session ──► reply ──► kf (send_msg) ──► WeCom HTTP
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod binding;
pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod frame;
pub mod kf;
pub mod registry;
pub mod reply;
pub mod routes;
pub mod session;
pub mod token;

pub use binding::{BindingStore, Clock, MemoryBindingStore, SystemClock};
pub use crypto::AesKeyPair;
pub use dispatch::Dispatcher;
pub use envelope::{CallbackEnvelope, MessageBody, SyncMessage};
pub use frame::Frame;
pub use kf::{KfClient, KfError, TextSender};
pub use registry::{ConnectionRegistry, GatewayHandle};
pub use reply::ReplyEngine;
pub use routes::build_router;
pub use session::SessionTimeouts;
pub use token::AccessTokenCache;

use relay_common::{Config, Error};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Process-wide relay state, shared by the HTTP and WebSocket surfaces.
pub struct AppState {
    pub config: Config,
    pub auth_secret: String,
    pub keys: AesKeyPair,
    pub registry: Arc<ConnectionRegistry>,
    pub bindings: Arc<dyn BindingStore>,
    pub kf: Arc<KfClient>,
    pub reply: Arc<ReplyEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub timeouts: SessionTimeouts,
}

impl AppState {
    /// Build production state from configuration.
    pub fn new(config: Config) -> Result<Arc<Self>, Error> {
        Self::with_options(config, None, SessionTimeouts::default())
    }

    /// Build state with an alternate WeCom API base and/or session timing;
    /// tests point the API at a mock and shrink the timeouts.
    pub fn with_options(
        config: Config,
        api_base: Option<&str>,
        timeouts: SessionTimeouts,
    ) -> Result<Arc<Self>, Error> {
        let keys = AesKeyPair::decode(&config.wecom.encoding_aes_key)
            .map_err(|e| Error::Config(e.to_string()))?;

        let kf = Arc::new(match api_base {
            Some(base) => KfClient::with_api_base(&config.wecom, base),
            None => KfClient::new(&config.wecom),
        });
        let registry = Arc::new(ConnectionRegistry::new());
        let bindings: Arc<dyn BindingStore> = Arc::new(MemoryBindingStore::default());
        let reply = Arc::new(ReplyEngine::new(kf.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            bindings.clone(),
            registry.clone(),
            kf.clone(),
            config.locale,
        ));

        Ok(Arc::new(Self {
            auth_secret: config.auth_secret.clone(),
            keys,
            registry,
            bindings,
            kf,
            reply,
            dispatcher,
            timeouts,
            config,
        }))
    }
}

/// Run the relay until ctrl-c.
///
/// Bind and serve failures surface as [`Error::Io`]; both are fatal.
pub async fn run(config: Config) -> relay_common::Result<()> {
    let bind: IpAddr = config
        .bind_address
        .parse()
        .map_err(|_| Error::Config(format!("Invalid BIND_ADDRESS '{}'", config.bind_address)))?;
    let http_addr = SocketAddr::from((bind, config.http_port));
    let ws_addr = SocketAddr::from((bind, config.ws_port));

    let state = AppState::new(config)?;

    let http_listener = TcpListener::bind(http_addr).await?;
    let ws_listener = TcpListener::bind(ws_addr).await?;
    tracing::info!(%http_addr, %ws_addr, "WeCom relay listening");

    let router = build_router(state.clone());

    tokio::select! {
        served = async { axum::serve(http_listener, router).await } => {
            served?;
        }
        () = session::serve(ws_listener, state.clone()) => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutdown signal received");
        }
    }

    // Close every gateway socket with a normal close; nothing else to flush
    state.registry.close_all("Relay shutting down");
    Ok(())
}
