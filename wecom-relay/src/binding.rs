//! Binding state: pending tokens and permanent user→gateway mappings.
//!
//! Both indices live under one guard so that token consumption, rebinding,
//! and bulk removal are atomic. Expired pending tokens are pruned lazily on
//! each access; nothing here performs I/O or holds the guard across awaits.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default pending-token lifetime.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(15 * 60);

const TOKEN_LEN: usize = 16;

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Storage seam for the binding state machine.
///
/// The relay core only talks to this trait; the in-memory implementation
/// below is the production default, and hosts with durable storage can
/// provide their own.
pub trait BindingStore: Send + Sync {
    /// Issue a fresh single-use token binding `gateway_id` for `ttl`.
    fn create_pending(&self, gateway_id: &str, ttl: Duration) -> String;

    /// Consume `candidate` if it matches a live pending token, returning
    /// the gateway it was issued for. A consumed or expired token resolves
    /// to `None`.
    fn resolve_pending(&self, candidate: &str) -> Option<String>;

    /// Upsert the permanent binding for a user, replacing any prior one.
    fn bind(&self, external_user_id: &str, gateway_id: &str);

    /// Current binding for a user, if any.
    fn lookup(&self, external_user_id: &str) -> Option<String>;

    /// Remove every binding targeting `gateway_id`; returns how many.
    fn unbind_all(&self, gateway_id: &str) -> usize;
}

#[derive(Debug, Clone)]
struct PendingBinding {
    gateway_id: String,
    expires_at: i64,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, PendingBinding>,
    bindings: HashMap<String, String>,
}

/// In-memory [`BindingStore`].
pub struct MemoryBindingStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryBindingStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn prune(inner: &mut Inner, now: i64) {
        inner.pending.retain(|_, p| p.expires_at > now);
    }

    fn generate_token(inner: &Inner) -> String {
        // Collisions are vanishingly rare at 16 alphanumeric chars, but the
        // uniqueness invariant is cheap to enforce
        loop {
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TOKEN_LEN)
                .map(char::from)
                .collect();
            if !inner.pending.contains_key(&token) {
                return token;
            }
        }
    }
}

impl Default for MemoryBindingStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl BindingStore for MemoryBindingStore {
    fn create_pending(&self, gateway_id: &str, ttl: Duration) -> String {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("binding store poisoned");
        Self::prune(&mut inner, now);

        let token = Self::generate_token(&inner);
        inner.pending.insert(
            token.clone(),
            PendingBinding {
                gateway_id: gateway_id.to_string(),
                expires_at: now + ttl.as_millis() as i64,
            },
        );
        token
    }

    fn resolve_pending(&self, candidate: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("binding store poisoned");
        Self::prune(&mut inner, now);
        inner.pending.remove(candidate).map(|p| p.gateway_id)
    }

    fn bind(&self, external_user_id: &str, gateway_id: &str) {
        let mut inner = self.inner.lock().expect("binding store poisoned");
        inner
            .bindings
            .insert(external_user_id.to_string(), gateway_id.to_string());
    }

    fn lookup(&self, external_user_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("binding store poisoned");
        inner.bindings.get(external_user_id).cloned()
    }

    fn unbind_all(&self, gateway_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("binding store poisoned");
        let before = inner.bindings.len();
        inner.bindings.retain(|_, gw| gw != gateway_id);
        before - inner.bindings.len()
    }
}
