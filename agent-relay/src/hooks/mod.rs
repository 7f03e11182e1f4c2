//! Hook emitter: ordered synchronous observers of broker stages.
//!
//! Handlers run in registration order on the emitting task. A handler
//! returning [`HookFlow::Stop`] halts propagation to the remaining handlers
//! for that event. A panicking handler is caught, logged, and treated as
//! [`HookFlow::Continue`] so one bad observer cannot wedge the broker.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

// Layer 2: Third-party crate imports
use parking_lot::RwLock;
use tracing::warn;

// Layer 3: Internal module imports
use crate::dlq::DeadLetter;
use crate::message::Envelope;
use crate::monitor::MemoryAlert;
use crate::util::AgentName;

/// Named hook points in the broker pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Before an accepted envelope is persisted and routed
    PreSend,
    /// After routing decisions are enqueued
    PostSend,
    /// Before a deliver frame is pushed to a recipient
    PreDeliver,
    /// After a recipient acknowledged a delivery
    PostDeliver,
    /// When an entry is quarantined
    DeadLetter,
    /// When an agent's presence changes
    PresenceChange,
    /// When the memory monitor raises an alert
    MemoryAlert,
}

impl HookKind {
    /// Stable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreSend => "pre_send",
            Self::PostSend => "post_send",
            Self::PreDeliver => "pre_deliver",
            Self::PostDeliver => "post_deliver",
            Self::DeadLetter => "dead_letter",
            Self::PresenceChange => "presence_change",
            Self::MemoryAlert => "memory_alert",
        }
    }
}

/// Payload handed to hook handlers.
#[derive(Debug, Clone)]
pub enum HookEvent {
    /// An envelope passed validation and is about to be persisted
    PreSend { envelope: Envelope },
    /// An envelope's recipient set was committed
    PostSend { envelope: Envelope },
    /// A delivery attempt is about to be pushed
    PreDeliver {
        envelope: Envelope,
        recipient: AgentName,
        attempt: u32,
    },
    /// A recipient acknowledged an envelope
    PostDeliver {
        envelope: Envelope,
        recipient: AgentName,
        attempts: u32,
    },
    /// A per-recipient delivery reached terminal failure
    DeadLetter { entry: DeadLetter },
    /// An agent connected or disconnected
    PresenceChange { agent: AgentName, online: bool },
    /// The memory monitor raised or cleared an alert
    MemoryAlert { alert: MemoryAlert },
}

impl HookEvent {
    /// The hook point this event belongs to.
    pub fn kind(&self) -> HookKind {
        match self {
            Self::PreSend { .. } => HookKind::PreSend,
            Self::PostSend { .. } => HookKind::PostSend,
            Self::PreDeliver { .. } => HookKind::PreDeliver,
            Self::PostDeliver { .. } => HookKind::PostDeliver,
            Self::DeadLetter { .. } => HookKind::DeadLetter,
            Self::PresenceChange { .. } => HookKind::PresenceChange,
            Self::MemoryAlert { .. } => HookKind::MemoryAlert,
        }
    }
}

/// Sentinel returned by handlers to control propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookFlow {
    /// Run the remaining handlers
    #[default]
    Continue,
    /// Skip the remaining handlers for this event
    Stop,
}

type HookHandler = Box<dyn Fn(&HookEvent) -> HookFlow + Send + Sync>;

/// Ordered dispatcher for hook handlers.
#[derive(Default)]
pub struct HookEmitter {
    handlers: RwLock<HashMap<HookKind, Vec<HookHandler>>>,
}

impl HookEmitter {
    /// Create an emitter with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for one hook point; handlers run in registration
    /// order.
    pub fn register<F>(&self, kind: HookKind, handler: F)
    where
        F: Fn(&HookEvent) -> HookFlow + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Invoke the handlers registered for this event's hook point.
    pub fn emit(&self, event: &HookEvent) {
        let handlers = self.handlers.read();
        let Some(chain) = handlers.get(&event.kind()) else {
            return;
        };
        for (position, handler) in chain.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(HookFlow::Continue) => {}
                Ok(HookFlow::Stop) => break,
                Err(_) => {
                    warn!(
                        hook = event.kind().as_str(),
                        position, "hook handler panicked, continuing"
                    );
                }
            }
        }
    }

    /// Number of handlers registered for a hook point.
    pub fn handler_count(&self, kind: HookKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for HookEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("HookEmitter")
            .field("hook_points", &handlers.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Recipient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn presence_event(name: &str) -> HookEvent {
        HookEvent::PresenceChange {
            agent: AgentName::parse(name).unwrap(),
            online: true,
        }
    }

    #[test]
    fn test_handlers_run_in_order() {
        let emitter = HookEmitter::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            emitter.register(HookKind::PresenceChange, move |_| {
                order.lock().push(i);
                HookFlow::Continue
            });
        }

        emitter.emit(&presence_event("Alice"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_stop_halts_propagation() {
        let emitter = HookEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        emitter.register(HookKind::PresenceChange, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            HookFlow::Stop
        });
        let c = Arc::clone(&calls);
        emitter.register(HookKind::PresenceChange, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            HookFlow::Continue
        });

        emitter.emit(&presence_event("Alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_contained() {
        let emitter = HookEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        emitter.register(HookKind::PresenceChange, |_| panic!("bad handler"));
        let c = Arc::clone(&calls);
        emitter.register(HookKind::PresenceChange, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            HookFlow::Continue
        });

        // The panic is swallowed and propagation continues.
        emitter.emit(&presence_event("Alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_route_by_kind() {
        let emitter = HookEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        emitter.register(HookKind::PreSend, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            HookFlow::Continue
        });

        emitter.emit(&presence_event("Alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let envelope = Envelope::new(
            AgentName::parse("Alice").unwrap(),
            Recipient::parse("Bob").unwrap(),
            "hi".to_string(),
        );
        emitter.emit(&HookEvent::PreSend { envelope });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_count() {
        let emitter = HookEmitter::new();
        assert_eq!(emitter.handler_count(HookKind::DeadLetter), 0);
        emitter.register(HookKind::DeadLetter, |_| HookFlow::Continue);
        assert_eq!(emitter.handler_count(HookKind::DeadLetter), 1);
    }
}
