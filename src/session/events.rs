//! Caller-facing notifications.
//!
//! Listeners are plain closures registered per channel. Emission clones the
//! listener list first and invokes each listener synchronously outside the
//! lock, so a listener may subscribe or unsubscribe without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde_json::Value;

use crate::core::{ConnectionState, Error, ErrorKind};
use crate::protocol::MessageType;

/// Handle returned by every `on_*` registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Inbound audio for playback
#[derive(Debug, Clone)]
pub struct AudioEvent {
    pub data: Bytes,
    pub sequence: u32,
    pub message_type: MessageType,
    pub session_id: Option<String>,
}

/// Any inbound structured message other than audio, errors and heartbeats
#[derive(Debug, Clone)]
pub struct DialogEvent {
    pub message_type: MessageType,
    pub sequence: u32,
    pub session_id: Option<String>,
    pub payload: Value,
}

/// A failure surfaced asynchronously
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    /// Server error code, for protocol errors
    pub code: Option<u32>,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorEvent {
            kind,
            code: None,
            message: message.into(),
        }
    }
}

impl From<&Error> for ErrorEvent {
    fn from(error: &Error) -> Self {
        let code = match error {
            Error::Protocol { code, .. } => Some(*code),
            _ => None,
        };
        ErrorEvent {
            kind: error.kind(),
            code,
            message: error.to_string(),
        }
    }
}

type StateListener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
type AudioListener = Arc<dyn Fn(&AudioEvent) + Send + Sync>;
type DialogListener = Arc<dyn Fn(&DialogEvent) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

struct Listeners<L> {
    entries: RwLock<Vec<(SubscriptionId, L)>>,
}

impl<L: Clone> Listeners<L> {
    fn new() -> Self {
        Listeners {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriptionId, listener: L) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<L> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Registry of notification listeners
pub struct EventRegistry {
    next_id: AtomicU64,
    state: Listeners<StateListener>,
    audio: Listeners<AudioListener>,
    dialog: Listeners<DialogListener>,
    error: Listeners<ErrorListener>,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry {
            next_id: AtomicU64::new(1),
            state: Listeners::new(),
            audio: Listeners::new(),
            dialog: Listeners::new(),
            error: Listeners::new(),
        }
    }

    fn allocate(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Called with `(old, new)` on every connection-level transition
    pub fn on_state_changed<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        let id = self.allocate();
        self.state.add(id, Arc::new(listener));
        id
    }

    /// Called for every inbound audio frame
    pub fn on_audio<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&AudioEvent) + Send + Sync + 'static,
    {
        let id = self.allocate();
        self.audio.add(id, Arc::new(listener));
        id
    }

    /// Called for every inbound dialogue message
    pub fn on_dialog<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&DialogEvent) + Send + Sync + 'static,
    {
        let id = self.allocate();
        self.dialog.add(id, Arc::new(listener));
        id
    }

    /// Called for asynchronous failures
    pub fn on_error<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        let id = self.allocate();
        self.error.add(id, Arc::new(listener));
        id
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.remove(id) || self.audio.remove(id) || self.dialog.remove(id) || self.error.remove(id)
    }

    /// Number of registered listeners across all channels
    pub fn listener_count(&self) -> usize {
        self.state.len() + self.audio.len() + self.dialog.len() + self.error.len()
    }

    pub(crate) fn emit_state(&self, old: ConnectionState, new: ConnectionState) {
        for listener in self.state.snapshot() {
            listener(old, new);
        }
    }

    pub(crate) fn emit_audio(&self, event: &AudioEvent) {
        for listener in self.audio.snapshot() {
            listener(event);
        }
    }

    pub(crate) fn emit_dialog(&self, event: &DialogEvent) {
        for listener in self.dialog.snapshot() {
            listener(event);
        }
    }

    pub(crate) fn emit_error(&self, event: &ErrorEvent) {
        for listener in self.error.snapshot() {
            listener(event);
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}
