//! Inbound message dispatch.
//!
//! Applies the binding rules to each message drained from `sync_msg` and
//! forwards what remains to the owning gateway as `inbound` frames. Batch
//! order is preserved; there is no cross-user ordering guarantee.

use crate::binding::{BindingStore, DEFAULT_PENDING_TTL};
use crate::envelope::{MessageBody, SyncMessage};
use crate::frame::Frame;
use crate::kf::TextSender;
use crate::registry::ConnectionRegistry;
use relay_common::Locale;
use std::sync::Arc;
use std::time::Duration;

/// Pending-token lifetime used by both the HTTP and WS binding flows.
pub const PENDING_TTL: Duration = DEFAULT_PENDING_TTL;

/// Welcome text sent to a user right after their binding resolves.
pub const fn welcome_text(locale: Locale) -> &'static str {
    match locale {
        Locale::Zh => "绑定成功，您现在可以开始对话了。",
        Locale::En => "You're all set. Send a message to start the conversation.",
    }
}

/// Routes inbound customer messages to gateways.
pub struct Dispatcher {
    bindings: Arc<dyn BindingStore>,
    registry: Arc<ConnectionRegistry>,
    sender: Arc<dyn TextSender>,
    locale: Locale,
}

impl Dispatcher {
    pub fn new(
        bindings: Arc<dyn BindingStore>,
        registry: Arc<ConnectionRegistry>,
        sender: Arc<dyn TextSender>,
        locale: Locale,
    ) -> Self {
        Self {
            bindings,
            registry,
            sender,
            locale,
        }
    }

    /// Dispatch one drained batch in receive order.
    pub async fn dispatch_batch(&self, messages: Vec<SyncMessage>) {
        for message in messages {
            self.dispatch_one(message).await;
        }
    }

    async fn dispatch_one(&self, message: SyncMessage) {
        if let MessageBody::Event(ref event) = message.body {
            if event.event_type == "enter_session" && !event.scene_param.is_empty() {
                match self.bindings.resolve_pending(event.scene_param.trim()) {
                    Some(gateway_id) => {
                        self.complete_binding(&message.external_userid, &gateway_id)
                            .await;
                    }
                    None => {
                        tracing::debug!(
                            scene_param = %event.scene_param,
                            "enter_session scene did not match a pending token"
                        );
                    }
                }
            } else {
                tracing::trace!(event_type = %event.event_type, "ignoring event");
            }
            return;
        }

        if !message.is_customer() {
            tracing::debug!(
                external_userid = %message.external_userid,
                origin = ?message.origin,
                "skipping non-customer message"
            );
            return;
        }

        // A bare pending token typed as text completes the binding and is
        // never forwarded as content
        if let MessageBody::Text { ref content } = message.body {
            if let Some(gateway_id) = self.bindings.resolve_pending(content.trim()) {
                self.complete_binding(&message.external_userid, &gateway_id)
                    .await;
                return;
            }
        }

        let Some(gateway_id) = self.bindings.lookup(&message.external_userid) else {
            tracing::debug!(
                external_userid = %message.external_userid,
                "no binding for user, dropping message"
            );
            return;
        };
        let Some(handle) = self.registry.get(&gateway_id) else {
            tracing::warn!(
                external_userid = %message.external_userid,
                gateway_id = %gateway_id,
                "gateway not connected, dropping message"
            );
            return;
        };

        let (msg_type, content) = match message.body {
            MessageBody::Text { content } => ("text", content),
            MessageBody::Image { media_id } => ("image", media_id),
            MessageBody::Voice { media_id } => ("voice", media_id),
            MessageBody::Unknown { .. } => ("unknown", String::new()),
            MessageBody::Event(_) => unreachable!("events handled above"),
        };

        let frame = Frame::Inbound {
            id: uuid::Uuid::new_v4().to_string(),
            external_user_id: message.external_userid.clone(),
            msg_type: msg_type.to_string(),
            content,
            timestamp: message.send_time,
        };
        if !handle.send_frame(&frame) {
            tracing::warn!(gateway_id = %gateway_id, "gateway writer gone, frame dropped");
        }
    }

    /// On-bind side effects: commit the binding, welcome the user, notify
    /// the gateway if it is currently connected.
    async fn complete_binding(&self, external_userid: &str, gateway_id: &str) {
        self.bindings.bind(external_userid, gateway_id);
        tracing::info!(
            external_userid = %external_userid,
            gateway_id = %gateway_id,
            "binding resolved"
        );

        if let Err(e) = self
            .sender
            .send_text(external_userid, welcome_text(self.locale))
            .await
        {
            tracing::warn!(external_userid = %external_userid, error = %e, "welcome message failed");
        }

        match self.registry.get(gateway_id) {
            Some(handle) => {
                handle.send_frame(&Frame::BindingResolved {
                    external_user_id: external_userid.to_string(),
                    gateway_id: gateway_id.to_string(),
                });
            }
            None => {
                tracing::debug!(gateway_id = %gateway_id, "gateway offline, binding_resolved not pushed");
            }
        }
    }
}
