//! Session lifecycle event bus.
//!
//! Synchronous in-process pub/sub for session observability:
//! - Typed subscriptions per `EventKind` plus wildcard subscriptions that
//!   see every event
//! - `Subscription` handles detach their handler on `unsubscribe()` (or
//!   are leaked with `forget()` to keep the handler alive for the bus's
//!   lifetime)
//! - A panicking handler is isolated: the panic is caught and logged, and
//!   remaining handlers still run

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// The lifecycle moments a session emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionCreated,
    SessionExpired,
    SessionTerminated,
    MessageEncrypted,
    MessageDecrypted,
    KeyRotated,
}

impl EventKind {
    /// Wire name, `namespace:action` style.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionCreated => "session:created",
            EventKind::SessionExpired => "session:expired",
            EventKind::SessionTerminated => "session:terminated",
            EventKind::MessageEncrypted => "message:encrypted",
            EventKind::MessageDecrypted => "message:decrypted",
            EventKind::KeyRotated => "key:rotated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted lifecycle event.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    /// Session the event concerns.
    pub session_id: String,
    /// Counterparty identity, where the emitting path knows it.
    pub remote_did: Option<String>,
    /// Message sequence number, for message events.
    pub sequence: Option<u64>,
    /// Unix milliseconds at emission.
    pub at: u64,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Handler)>>,
    wildcard: Vec<(u64, Handler)>,
}

/// Handle for one registered handler.
///
/// Dropping the handle does NOT detach the handler; call `unsubscribe()`
/// to remove it, or `forget()` to make the registration explicit-permanent.
#[must_use = "call unsubscribe() to detach the handler, or forget() to keep it"]
pub struct Subscription {
    registry: Arc<Mutex<Registry>>,
    kind: Option<EventKind>,
    id: u64,
}

impl Subscription {
    /// Detach the handler. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let mut registry = self.registry.lock();
        match self.kind {
            Some(kind) => {
                if let Some(handlers) = registry.by_kind.get_mut(&kind) {
                    handlers.retain(|(id, _)| *id != self.id);
                }
            }
            None => registry.wildcard.retain(|(id, _)| *id != self.id),
        }
    }

    /// Keep the handler registered for the lifetime of the bus.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

/// Synchronous pub/sub hub for session lifecycle events.
#[derive(Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            registry: Arc::clone(&self.registry),
            kind: Some(kind),
            id,
        }
    }

    /// Subscribe to every event kind.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.wildcard.push((id, Arc::new(handler)));
        Subscription {
            registry: Arc::clone(&self.registry),
            kind: None,
            id,
        }
    }

    /// Deliver `event` to its typed handlers, then the wildcard handlers.
    ///
    /// Handlers run synchronously on the emitting thread, outside the
    /// registry lock, so a handler may subscribe or unsubscribe without
    /// deadlocking. A panic in one handler is caught and logged; delivery
    /// continues with the next handler.
    pub fn emit(&self, event: &Event) {
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock();
            let typed = registry
                .by_kind
                .get(&event.kind)
                .into_iter()
                .flatten()
                .map(|(_, h)| Arc::clone(h));
            let wild = registry.wildcard.iter().map(|(_, h)| Arc::clone(h));
            typed.chain(wild).collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(
                    event = event.kind.as_str(),
                    session_id = %event.session_id,
                    "event handler panicked"
                );
            }
        }
    }
}

// ============================================================
// TESTS
// ============================================================
