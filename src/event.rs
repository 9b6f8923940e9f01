//! Event bus for lifecycle and user events.
//!
//! Callbacks are registered per event id and invoked in insertion order on
//! dispatch. Each registration may carry a throttle: a callback whose
//! throttle window has not elapsed is skipped, and a successful invocation
//! opens a new window. Reserved lifecycle events are a closed enumeration;
//! user-defined events live in a disjoint string-tagged space so they can
//! never collide with the built-in set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::timer::IdleProbe;

/// Identifier of a dispatchable event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    /// A recoverable or fatal error was surfaced.
    Error,
    /// An otherwise-unhandled signal was received; args carry the number.
    Signal,
    /// Dispatched once during controller init, before the service setup.
    /// Lock providers run their duplicate-instance gate here.
    Init,
    /// Dispatched immediately before the user routine each iteration.
    PreExecute,
    /// Dispatched immediately after the user routine each iteration.
    PostExecute,
    /// A background member (task or pool) was spawned.
    Fork,
    /// The daemon process identity changed (detached replacement).
    PidChange,
    /// The iteration finished under budget; args carry the idle probe.
    Idle,
    /// The controller is tearing down.
    Shutdown,
    /// User-defined event, disjoint from the reserved set.
    User(Arc<str>),
}

impl EventId {
    /// Build a user-defined event id from a tag.
    pub fn user<S: AsRef<str>>(tag: S) -> Self {
        Self::User(Arc::from(tag.as_ref()))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Signal => write!(f, "signal"),
            Self::Init => write!(f, "init"),
            Self::PreExecute => write!(f, "pre-execute"),
            Self::PostExecute => write!(f, "post-execute"),
            Self::Fork => write!(f, "fork"),
            Self::PidChange => write!(f, "pid-change"),
            Self::Idle => write!(f, "idle"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::User(tag) => write!(f, "user:{tag}"),
        }
    }
}

/// Payload handed to callbacks on dispatch.
#[derive(Debug, Clone)]
pub enum EventArgs {
    /// No payload.
    None,
    /// Signal number.
    Signal(i32),
    /// Human-readable message (errors, member names).
    Message(String),
    /// Idle probe; listeners consult it to abort long idle work early.
    Idle(IdleProbe),
    /// Structured payload for user events.
    Value(serde_json::Value),
}

/// Callback invoked on dispatch. A returned error aborts the dispatch and
/// is surfaced to the dispatching caller.
pub type Callback = Box<dyn FnMut(&EventArgs) -> Result<()> + Send>;

/// Opaque registration handle returned by [`EventBus::on`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackHandle {
    event: EventId,
    seq: u64,
}

impl CallbackHandle {
    /// The event this handle is registered under.
    #[must_use]
    pub fn event(&self) -> &EventId {
        &self.event
    }
}

struct Entry {
    seq: u64,
    callback: Callback,
    throttle: Option<Duration>,
    next_allowed_at: Option<Instant>,
}

impl Entry {
    fn throttled(&self, now: Instant) -> bool {
        self.next_allowed_at.is_some_and(|at| at > now)
    }

    fn invoke(&mut self, args: &EventArgs, now: Instant) -> Result<()> {
        if let Some(throttle) = self.throttle {
            self.next_allowed_at = Some(now + throttle);
        }
        (self.callback)(args)
    }
}

/// Registry of event callbacks with per-callback throttling.
#[derive(Default)]
pub struct EventBus {
    entries: HashMap<EventId, Vec<Entry>>,
    next_seq: u64,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event`, optionally throttled, and return a
    /// handle usable with [`off`](Self::off) and
    /// [`dispatch_one`](Self::dispatch_one).
    pub fn on(
        &mut self,
        event: EventId,
        callback: Callback,
        throttle: Option<Duration>,
    ) -> CallbackHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.entry(event.clone()).or_default().push(Entry {
            seq,
            callback,
            throttle,
            next_allowed_at: None,
        });
        CallbackHandle { event, seq }
    }

    /// Remove the callback behind `handle`. Returns whether a callback was
    /// actually removed; removing twice is a no-op.
    pub fn off(&mut self, handle: &CallbackHandle) -> bool {
        let Some(entries) = self.entries.get_mut(&handle.event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.seq != handle.seq);
        let removed = entries.len() < before;
        if entries.is_empty() {
            self.entries.remove(&handle.event);
        }
        removed
    }

    /// Dispatch `event` to every registered callback in insertion order.
    /// Callbacks inside their throttle window are skipped. Dispatching an
    /// event nobody registered for is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates the first callback error; remaining callbacks for this
    /// dispatch are not invoked.
    pub fn dispatch(&mut self, event: &EventId, args: &EventArgs) -> Result<()> {
        let Some(entries) = self.entries.get_mut(event) else {
            return Ok(());
        };
        let now = Instant::now();
        for entry in entries.iter_mut() {
            if entry.throttled(now) {
                continue;
            }
            entry.invoke(args, now)?;
        }
        Ok(())
    }

    /// Dispatch to the single callback behind `handle`, honoring its
    /// throttle. Unknown handles are a no-op.
    ///
    /// # Errors
    ///
    /// Propagates the callback's error.
    pub fn dispatch_one(&mut self, handle: &CallbackHandle, args: &EventArgs) -> Result<()> {
        let Some(entries) = self.entries.get_mut(&handle.event) else {
            return Ok(());
        };
        let now = Instant::now();
        if let Some(entry) = entries.iter_mut().find(|e| e.seq == handle.seq) {
            if !entry.throttled(now) {
                entry.invoke(args, now)?;
            }
        }
        Ok(())
    }

    /// Drop every registered callback. Used by restart to prevent
    /// re-entrant dispatch during the re-exec.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of registered callbacks across all events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_dispatch_in_insertion_order() {
        let mut bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            bus.on(
                EventId::PreExecute,
                Box::new(move |_| {
                    order.lock().push(tag);
                    Ok(())
                }),
                None,
            );
        }
        bus.dispatch(&EventId::PreExecute, &EventArgs::None).unwrap();
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let mut bus = EventBus::new();
        bus.dispatch(&EventId::user("nobody-home"), &EventArgs::None)
            .unwrap();
    }

    #[test]
    fn test_on_then_off_is_identity() {
        let mut bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = bus.on(EventId::Idle, counting(&counter), None);
        assert!(bus.off(&handle));
        assert!(!bus.off(&handle));
        bus.dispatch(&EventId::Idle, &EventArgs::None).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_throttle_limits_invocations() {
        let mut bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(
            EventId::user("tick"),
            counting(&counter),
            Some(Duration::from_secs(2)),
        );

        // Ten dispatches inside one second: only the first may run.
        let deadline = Instant::now() + Duration::from_millis(900);
        for _ in 0..10 {
            bus.dispatch(&EventId::user("tick"), &EventArgs::None)
                .unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(Instant::now() < deadline + Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_throttle_is_per_callback() {
        let mut bus = EventBus::new();
        let throttled = Arc::new(AtomicUsize::new(0));
        let free = Arc::new(AtomicUsize::new(0));
        bus.on(
            EventId::PostExecute,
            counting(&throttled),
            Some(Duration::from_secs(60)),
        );
        bus.on(EventId::PostExecute, counting(&free), None);

        for _ in 0..5 {
            bus.dispatch(&EventId::PostExecute, &EventArgs::None).unwrap();
        }
        assert_eq!(throttled.load(Ordering::SeqCst), 1);
        assert_eq!(free.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_dispatch_one_targets_single_callback() {
        let mut bus = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let _first = bus.on(EventId::Error, counting(&first), None);
        let handle = bus.on(EventId::Error, counting(&second), None);

        bus.dispatch_one(&handle, &EventArgs::None).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_error_aborts_dispatch() {
        let mut bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(
            EventId::Init,
            Box::new(|_| Err(crate::error::Error::lock("lease held elsewhere"))),
            None,
        );
        bus.on(EventId::Init, counting(&counter), None);

        assert!(bus.dispatch(&EventId::Init, &EventArgs::None).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_user_events_are_disjoint_from_reserved() {
        assert_ne!(EventId::user("error"), EventId::Error);
        assert_eq!(EventId::user("metrics"), EventId::user("metrics"));
    }
}
