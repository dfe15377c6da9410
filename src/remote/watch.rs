//! Remote watch declarations.
//!
//! A [`Watch`] names a resource kind and the predicates an event of that kind
//! must pass. Watches are matched by kind only: a remote holds at most one
//! watch per kind and merges predicates into it.

use std::fmt;
use std::sync::Arc;

use super::framework::{EventRef, Predicate};

/// Interest in one resource kind.
#[derive(Clone)]
pub struct Watch {
    kind: String,
    predicates: Vec<Arc<dyn Predicate>>,
    pub(crate) started: bool,
}

impl Watch {
    /// Watches every event of `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            predicates: Vec::new(),
            started: false,
        }
    }

    /// Adds a predicate. Events must pass all of them.
    pub fn with_predicate(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Watched kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Predicates, in insertion order.
    pub fn predicates(&self) -> &[Arc<dyn Predicate>] {
        &self.predicates
    }

    /// True when registered with a running manager.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Kind match.
    pub fn matches(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// True when every predicate accepts the event.
    pub fn accepts(&self, event: EventRef<'_>) -> bool {
        self.predicates.iter().all(|p| event.accepted_by(p.as_ref()))
    }

    /// Adds the predicates of `other` not already present. Identity is the
    /// predicate allocation, so the same `Arc` is never added twice.
    pub(crate) fn merge(&mut self, other: &Watch) {
        for p in &other.predicates {
            if !self.predicates.iter().any(|have| same(have, p)) {
                self.predicates.push(Arc::clone(p));
            }
        }
    }
}

fn same(a: &Arc<dyn Predicate>, b: &Arc<dyn Predicate>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("kind", &self.kind)
            .field("predicates", &self.predicates.len())
            .field("started", &self.started)
            .finish()
    }
}
