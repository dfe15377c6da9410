//! # Relays and the Router
//!
//! A relay forwards remote events into a local controller. The remote's
//! router is registered as the only predicate on every underlying kind watch
//! and fans each event out to the relays that want it.
//!
//! ```text
//!   cluster event (kind K)
//!         │
//!         ▼
//!   Router ── remote Watch(K) predicates ── reject ──► dropped
//!         │ accept
//!         ├──► Relay 1: Watch(K) + predicates ─ accept ─► try_send(Generic{target1})
//!         ├──► Relay 2: Watch(J)                (kind mismatch, skipped)
//!         └──► Relay 3: Watch(K) + predicates ─ accept ─► try_send(Generic{target3})
//!         │
//!         ▼
//!   returns false (nothing enqueued on the remote side)
//! ```
//!
//! A relay does not carry the remote object. It carries a fixed target, so the
//! local controller reconciles the target whenever anything it watches moves.
//! That makes the channel level-triggered: when it is full, the pending event
//! already covers the new one, and the send is dropped.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use super::framework::{
    CreateEvent, DeleteEvent, EventRef, GenericEvent, Object, ObjectRef, Predicate, UpdateEvent,
};
use super::watch::Watch;

/// Default depth of a relay channel.
pub const RELAY_CHANNEL_CAPACITY: usize = 8;

static NEXT_RELAY_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a relay, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayId(u64);

impl RelayId {
    fn next() -> Self {
        RelayId(NEXT_RELAY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay-{}", self.0)
    }
}

// =============================================================================
// Forward
// =============================================================================

/// The sending half of a relay. `None` once closed.
struct Forward {
    event: GenericEvent,
    channel: Mutex<Option<mpsc::Sender<GenericEvent>>>,
}

impl Forward {
    /// Sends the target event without blocking. Returns true when queued.
    fn send(&self) -> bool {
        let channel = self.channel.lock();
        let Some(tx) = channel.as_ref() else {
            return false;
        };
        match tx.try_send(self.event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(to = %self.event.object.reference(), "relay channel full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(to = %self.event.object.reference(), "relay consumer gone, event dropped");
                false
            }
        }
    }

    fn close(&self) -> bool {
        self.channel.lock().take().is_some()
    }

    fn is_closed(&self) -> bool {
        self.channel.lock().is_none()
    }
}

// =============================================================================
// Relay
// =============================================================================

/// Forwards accepted remote events as generic events on a fixed target.
#[derive(Clone)]
pub struct Relay {
    id: RelayId,
    target: ObjectRef,
    watches: Vec<Watch>,
    forward: Arc<Forward>,
}

impl Relay {
    /// Creates a relay with the default channel depth.
    pub fn new(target: ObjectRef, watches: Vec<Watch>) -> (Relay, RelaySource) {
        Self::with_capacity(target, watches, RELAY_CHANNEL_CAPACITY)
    }

    /// Creates a relay with the given channel depth (minimum 1).
    pub fn with_capacity(
        target: ObjectRef,
        watches: Vec<Watch>,
        capacity: usize,
    ) -> (Relay, RelaySource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let relay = Relay {
            id: RelayId::next(),
            forward: Arc::new(Forward {
                event: GenericEvent {
                    object: Object::from(&target),
                },
                channel: Mutex::new(Some(tx)),
            }),
            target,
            watches,
        };
        (relay, RelaySource { rx })
    }

    /// The same relay (same identity and channel) with a new watch list.
    pub fn with_watches(&self, watches: Vec<Watch>) -> Relay {
        Relay {
            id: self.id,
            target: self.target.clone(),
            watches,
            forward: Arc::clone(&self.forward),
        }
    }

    /// Identity.
    pub fn id(&self) -> RelayId {
        self.id
    }

    /// Object reported to the local controller.
    pub fn target(&self) -> &ObjectRef {
        &self.target
    }

    /// Subscribed watches.
    pub fn watches(&self) -> &[Watch] {
        &self.watches
    }

    /// Distinct kinds this relay subscribes to.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.watches.iter().map(|w| w.kind().to_string()).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// True once shut down.
    pub fn is_closed(&self) -> bool {
        self.forward.is_closed()
    }

    /// Forwards the target if any watch of the event's kind accepts it.
    pub(crate) fn offer(&self, event: EventRef<'_>) -> bool {
        let kind = &event.object().kind;
        let wanted = self
            .watches
            .iter()
            .any(|w| w.matches(kind) && w.accepts(event));
        wanted && self.forward.send()
    }

    /// Closes the channel. The source ends once drained.
    pub(crate) fn shutdown(&self) {
        if self.forward.close() {
            debug!(relay = %self.id, to = %self.target, "relay closed");
        }
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("watches", &self.watches)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The receiving half of a relay, consumed by the local controller.
///
/// Implements [`Stream`]; ends after the relay shuts down and the buffered
/// events are drained.
#[derive(Debug)]
pub struct RelaySource {
    rx: mpsc::Receiver<GenericEvent>,
}

impl RelaySource {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<GenericEvent> {
        self.rx.recv().await
    }

    /// Takes a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<GenericEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for RelaySource {
    type Item = GenericEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Router
// =============================================================================

/// Watches and relays of one remote.
#[derive(Default)]
pub(crate) struct Routes {
    pub(crate) watches: Vec<Watch>,
    pub(crate) relays: Vec<Relay>,
}

/// The predicate a remote installs on every kind it watches.
pub(crate) struct Router {
    routes: Arc<RwLock<Routes>>,
}

impl Router {
    pub(crate) fn new(routes: Arc<RwLock<Routes>>) -> Self {
        Self { routes }
    }

    /// Forwards `event` to every interested relay. Returns the number of
    /// relays that queued it.
    pub(crate) fn route(&self, event: EventRef<'_>) -> usize {
        let routes = self.routes.read();
        let kind = &event.object().kind;
        let Some(watch) = routes.watches.iter().find(|w| w.matches(kind)) else {
            return 0;
        };
        if !watch.accepts(event) {
            return 0;
        }
        routes.relays.iter().filter(|r| r.offer(event)).count()
    }
}

impl Predicate for Router {
    fn create(&self, event: &CreateEvent) -> bool {
        self.route(EventRef::Create(event));
        false
    }

    fn update(&self, event: &UpdateEvent) -> bool {
        self.route(EventRef::Update(event));
        false
    }

    fn delete(&self, event: &DeleteEvent) -> bool {
        self.route(EventRef::Delete(event));
        false
    }

    fn generic(&self, event: &GenericEvent) -> bool {
        self.route(EventRef::Generic(event));
        false
    }
}
