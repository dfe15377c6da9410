//! Seams to the hosting reconciliation framework.
//!
//! The framework owns the cluster connection and its per-kind watches. This
//! crate only needs to register a predicate per resource kind and start the
//! event loop with a done signal, so that is all these traits ask for.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::cluster::RestConfig;
use crate::Result;

// =============================================================================
// Objects
// =============================================================================

/// Identity of a cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Resource kind.
    pub kind: String,
    /// Namespace, empty for cluster-scoped resources.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl ObjectRef {
    /// Builds a reference.
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A cluster resource as seen in an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Resource kind.
    pub kind: String,
    /// Namespace.
    #[serde(default)]
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Resource labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Resource body.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Object {
    /// An object with no labels and no body.
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            labels: BTreeMap::new(),
            data: serde_json::Value::Null,
        }
    }

    /// Adds a label.
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// The object's identity.
    pub fn reference(&self) -> ObjectRef {
        ObjectRef::new(&self.kind, &self.namespace, &self.name)
    }
}

impl From<&ObjectRef> for Object {
    fn from(r: &ObjectRef) -> Self {
        Object::new(&r.kind, &r.namespace, &r.name)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A resource appeared.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateEvent {
    /// The new resource.
    pub object: Object,
}

/// A resource changed.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    /// State before.
    pub old: Object,
    /// State after.
    pub new: Object,
}

/// A resource went away.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteEvent {
    /// The last known state.
    pub object: Object,
}

/// An event from a non-cluster source, such as a relay.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericEvent {
    /// Subject of the event.
    pub object: Object,
}

/// Borrowed view of any event.
#[derive(Debug, Clone, Copy)]
pub enum EventRef<'a> {
    /// Create.
    Create(&'a CreateEvent),
    /// Update.
    Update(&'a UpdateEvent),
    /// Delete.
    Delete(&'a DeleteEvent),
    /// Generic.
    Generic(&'a GenericEvent),
}

impl<'a> EventRef<'a> {
    /// The object an event is about. Updates report the new state.
    pub fn object(&self) -> &'a Object {
        match *self {
            EventRef::Create(e) => &e.object,
            EventRef::Update(e) => &e.new,
            EventRef::Delete(e) => &e.object,
            EventRef::Generic(e) => &e.object,
        }
    }

    /// Evaluates `predicate` with the method matching this event.
    pub fn accepted_by(&self, predicate: &dyn Predicate) -> bool {
        match *self {
            EventRef::Create(e) => predicate.create(e),
            EventRef::Update(e) => predicate.update(e),
            EventRef::Delete(e) => predicate.delete(e),
            EventRef::Generic(e) => predicate.generic(e),
        }
    }
}

// =============================================================================
// Framework Traits
// =============================================================================

/// Event filter. Returning false keeps an event out of the reconcile queue.
///
/// Every method accepts by default.
pub trait Predicate: Send + Sync {
    /// Filters create events.
    fn create(&self, _event: &CreateEvent) -> bool {
        true
    }

    /// Filters update events.
    fn update(&self, _event: &UpdateEvent) -> bool {
        true
    }

    /// Filters delete events.
    fn delete(&self, _event: &DeleteEvent) -> bool {
        true
    }

    /// Filters generic events.
    fn generic(&self, _event: &GenericEvent) -> bool {
        true
    }
}

/// Accepts objects carrying every given label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchLabels(pub BTreeMap<String, String>);

impl MatchLabels {
    fn matches(&self, object: &Object) -> bool {
        self.0
            .iter()
            .all(|(k, v)| object.labels.get(k).is_some_and(|have| have == v))
    }
}

impl Predicate for MatchLabels {
    fn create(&self, event: &CreateEvent) -> bool {
        self.matches(&event.object)
    }

    fn update(&self, event: &UpdateEvent) -> bool {
        self.matches(&event.new)
    }

    fn delete(&self, event: &DeleteEvent) -> bool {
        self.matches(&event.object)
    }

    fn generic(&self, event: &GenericEvent) -> bool {
        self.matches(&event.object)
    }
}

/// Done signal handed to a manager's event loop.
#[derive(Debug, Clone)]
pub struct Done(watch::Receiver<bool>);

impl Done {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    /// True once the owning remote shut down.
    pub fn is_done(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves when the owning remote shuts down.
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One connection to a cluster, as provided by the hosting framework.
pub trait Manager: Send {
    /// Watches resources of `kind`, filtering every event through
    /// `predicate`.
    fn watch(&mut self, kind: &str, predicate: Arc<dyn Predicate>) -> Result<()>;

    /// Starts the event loop. Must not block; the loop runs until `done`
    /// fires.
    fn start(&mut self, done: Done) -> Result<()>;
}

/// Builds managers from connection parameters.
pub trait Connector: Send + Sync {
    /// Connects to the cluster described by `config`.
    fn connect(&self, name: &str, config: &RestConfig) -> Result<Box<dyn Manager>>;
}
