//! HTTP ingress for the relay.
//!
//! Two surfaces: the WeCom callback endpoints (GET URL verification and
//! POST webhook) and the gateway-facing binding endpoints. Webhook
//! handlers always acknowledge with `200 "success"` — WeCom retries on
//! anything else — and defer real work to background tasks.

use crate::binding::BindingStore;
use crate::crypto::{self, verify_signature};
use crate::dispatch::PENDING_TTL;
use crate::envelope::{extract_encrypt, CallbackEnvelope};
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

const WEBHOOK_ACK: &str = "success";

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(default)]
    msg_signature: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    echostr: String,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    msg_signature: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct GatewayRequest {
    gateway_id: String,
}

#[derive(Debug, Serialize)]
struct CreateBindingResponse {
    token: String,
    customer_service_url: String,
}

#[derive(Debug, Serialize)]
struct UnbindResponse {
    removed: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "wecom-relay",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET URL verification: echo the decrypted `echostr` on a valid signature.
async fn verify_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    let wecom = &state.config.wecom;
    if verify_signature(
        &wecom.callback_token,
        &query.timestamp,
        &query.nonce,
        &query.echostr,
        &query.msg_signature,
    )
    .is_err()
    {
        tracing::warn!("callback verification: signature mismatch");
        return (StatusCode::OK, String::new());
    }

    match crypto::decrypt(&query.echostr, &state.keys, &wecom.corp_id) {
        Ok(plain) => (StatusCode::OK, plain),
        Err(e) => {
            tracing::error!(error = %e, "callback verification: echostr decrypt failed");
            (StatusCode::OK, String::new())
        }
    }
}

/// POST webhook: acknowledge immediately, pump + dispatch off-thread.
async fn receive_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> &'static str {
    let encrypt = match extract_encrypt(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "webhook body had no encrypted payload");
            return WEBHOOK_ACK;
        }
    };

    let wecom = &state.config.wecom;
    if verify_signature(
        &wecom.callback_token,
        &query.timestamp,
        &query.nonce,
        &encrypt,
        &query.msg_signature,
    )
    .is_err()
    {
        // Silent drop; WeCom will retry with a fresh signature
        tracing::warn!("webhook signature mismatch, dropping");
        return WEBHOOK_ACK;
    }

    let plain = match crypto::decrypt(&encrypt, &state.keys, &wecom.corp_id) {
        Ok(plain) => plain,
        Err(e) => {
            tracing::error!(error = %e, "webhook decrypt failed, dropping");
            return WEBHOOK_ACK;
        }
    };

    let envelope = CallbackEnvelope::parse(&plain);
    if envelope.msg_type == "event" && envelope.event == "kf_msg_or_event" {
        let state = state.clone();
        tokio::spawn(async move {
            match state.kf.sync_messages(&envelope.token).await {
                Ok(batch) => state.dispatcher.dispatch_batch(batch).await,
                Err(e) => {
                    tracing::error!(error = %e, "sync_msg pump failed");
                }
            }
        });
    } else {
        tracing::debug!(
            msg_type = %envelope.msg_type,
            event = %envelope.event,
            "ignoring callback"
        );
    }

    WEBHOOK_ACK
}

fn authorized(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|bearer| crypto::constant_time_eq(bearer, secret))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "unauthorized".into(),
        }),
    )
        .into_response()
}

/// Issue a pending binding token for a gateway.
async fn create_binding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GatewayRequest>,
) -> Response {
    if !authorized(&headers, &state.auth_secret) {
        return unauthorized();
    }

    let token = state
        .bindings
        .create_pending(&request.gateway_id, PENDING_TTL);
    match state.kf.customer_service_url(&token).await {
        Ok(url) => Json(CreateBindingResponse {
            token,
            customer_service_url: url,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(gateway_id = %request.gateway_id, error = %e, "customer-service URL unavailable");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Remove every binding for a gateway.
async fn unbind_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GatewayRequest>,
) -> Response {
    if !authorized(&headers, &state.auth_secret) {
        return unauthorized();
    }

    let removed = state.bindings.unbind_all(&request.gateway_id);
    tracing::info!(gateway_id = %request.gateway_id, removed, "bindings removed");
    Json(UnbindResponse { removed }).into_response()
}

// ============================================================================
// Router builder
// ============================================================================

/// Build the ingress router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/wecom/callback", get(verify_callback).post(receive_callback))
        .route("/bindings/create", post(create_binding))
        .route("/bindings/unbind_all", post(unbind_all))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(RequestBodyLimitLayer::new(256 * 1024))
        .with_state(state)
}
