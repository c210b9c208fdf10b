//! Callback correlation between a consumer and a bridge backend.
//!
//! A consumer registers a handler and receives an opaque [`CallbackToken`]. The
//! backend later emits `(token, message)` pairs on a shared, ordered event
//! channel; [`CallbackRegistry::deliver`] routes each one to its handler at
//! most once and forgets the registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BridgeError;

/// Opaque identifier pairing a pending callback-bearing call with its message.
///
/// Format: `cb-<sequence>-<uuid-v4>`. The sequence is unique per registry; the
/// random part keeps tokens from different registries (or processes) apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(String);

impl CallbackToken {
    fn generate(sequence: u64) -> Self {
        Self(format!("cb-{sequence}-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallbackToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallbackToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message on the callback event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub token: CallbackToken,
    pub message: String,
}

type Handler = Box<dyn FnOnce(String) + Send>;

/// Table of outstanding callback registrations.
///
/// Registrations that never see a matching event are not expired here; use
/// [`CallbackRegistry::with_limit`] or [`CallbackRegistry::cancel`] to bound
/// them.
pub struct CallbackRegistry {
    sequence: AtomicU64,
    handlers: Mutex<HashMap<CallbackToken, Handler>>,
    max_pending: Option<usize>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("pending", &self.pending())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
            max_pending: None,
        }
    }

    /// Refuse new registrations once `max_pending` are outstanding.
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            max_pending: Some(max_pending),
            ..Self::new()
        }
    }

    /// Register a handler and return the token the backend must echo back.
    pub fn register<F>(&self, handler: F) -> Result<CallbackToken, BridgeError>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let mut handlers = self.lock();
        if let Some(limit) = self.max_pending {
            if handlers.len() >= limit {
                tracing::warn!(limit, "Callback registration refused");
                return Err(BridgeError::CallbackLimitReached(limit));
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let token = CallbackToken::generate(sequence);
        handlers.insert(token.clone(), Box::new(handler));
        tracing::debug!(token = %token, pending = handlers.len(), "Callback registered");
        Ok(token)
    }

    /// Route `message` to the handler registered under `token`.
    ///
    /// Returns `false` for unknown tokens (late or duplicate events), which are
    /// otherwise ignored. The handler runs outside the registry lock.
    pub fn deliver(&self, token: &CallbackToken, message: String) -> bool {
        let handler = self.lock().remove(token);
        match handler {
            Some(handler) => {
                tracing::debug!(token = %token, "Callback delivered");
                handler(message);
                true
            }
            None => {
                tracing::debug!(token = %token, "No registration for callback event, dropped");
                false
            }
        }
    }

    /// Drop a registration without invoking it.
    pub fn cancel(&self, token: &CallbackToken) -> bool {
        self.lock().remove(token).is_some()
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Deliver every event from `events` until the channel closes.
    pub async fn pump(&self, mut events: mpsc::UnboundedReceiver<CallbackEvent>) {
        while let Some(event) = events.recv().await {
            self.deliver(&event.token, event.message);
        }
        tracing::debug!("Callback event channel closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CallbackToken, Handler>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
