//! Remote registry.
//!
//! Maps the identity of the local object that owns a remote connection (for
//! example a cluster resource holding credentials) to the live [`Remote`].
//!
//! ```text
//!   ensure(owner, candidate)
//!       │
//!       ├── no entry ──────────────► candidate.start(), register
//!       │
//!       ├── entry equals candidate ─► existing.start(), return existing
//!       │
//!       └── entry differs ─────────► candidate.take_workload(old)
//!                                     old.shutdown()
//!                                     register candidate
//!                                     candidate.start()
//! ```
//!
//! The map mutex is held for the whole of `ensure`, so concurrent ensures for
//! the same owner serialize and never leave two started remotes behind.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::cluster::Remote;
use super::framework::ObjectRef;
use super::relay::{Relay, RelayId};
use super::watch::Watch;
use crate::{Error, Result};

/// Owner to remote map.
#[derive(Debug, Default)]
pub struct Registry {
    remotes: Mutex<HashMap<ObjectRef, Arc<Remote>>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `candidate` (or an equal, already registered remote) the started
    /// remote for `owner`, and returns whichever is registered.
    ///
    /// When the registered remote differs from `candidate`, its watches and
    /// relays move to `candidate` before it is shut down. The candidate is
    /// registered even if it then fails to start, so the moved workload is
    /// kept for the next attempt; the start error is returned.
    pub fn ensure(&self, owner: &ObjectRef, candidate: Arc<Remote>) -> Result<Arc<Remote>> {
        // Held across start, which connects. Releasing it would let a second
        // ensure for the same owner start a duplicate remote. Start errors
        // arrive already wrapped by the remote.
        let mut remotes = self.remotes.lock();
        match remotes.get(owner).cloned() {
            Some(existing) if existing.equals(&candidate) => {
                existing.start()?;
                Ok(existing)
            }
            Some(old) => {
                candidate.take_workload(&old)?;
                old.shutdown();
                remotes.insert(owner.clone(), Arc::clone(&candidate));
                info!(owner = %owner, from = %old.name(), to = %candidate.name(), "remote replaced");
                candidate.start()?;
                Ok(candidate)
            }
            None => {
                candidate.start()?;
                remotes.insert(owner.clone(), Arc::clone(&candidate));
                info!(owner = %owner, remote = %candidate.name(), "remote registered");
                Ok(candidate)
            }
        }
    }

    /// Registers without starting. Returns the remote it replaced, which is
    /// left running.
    pub fn add(&self, owner: ObjectRef, remote: Arc<Remote>) -> Option<Arc<Remote>> {
        self.remotes.lock().insert(owner, remote)
    }

    /// Unregisters without shutting down.
    pub fn delete(&self, owner: &ObjectRef) -> Option<Arc<Remote>> {
        self.remotes.lock().remove(owner)
    }

    /// The remote registered for `owner`.
    pub fn find(&self, owner: &ObjectRef) -> Option<Arc<Remote>> {
        self.remotes.lock().get(owner).cloned()
    }

    /// Adds a watch to the remote of `owner`.
    pub fn ensure_watch(&self, owner: &ObjectRef, watch: Watch) -> Result<()> {
        self.require(owner)?.ensure_watch(watch)
    }

    /// Installs a relay on the remote of `owner`.
    pub fn ensure_relay(&self, owner: &ObjectRef, relay: Relay) -> Result<()> {
        self.require(owner)?.ensure_relay(relay)
    }

    /// Ends a relay on the remote of `owner`. `Ok(false)` when the relay is
    /// not installed.
    pub fn end_relay(&self, owner: &ObjectRef, id: RelayId) -> Result<bool> {
        Ok(self.require(owner)?.end_relay(id))
    }

    /// Shuts down and unregisters every remote.
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<Remote>> = self.remotes.lock().drain().map(|(_, r)| r).collect();
        for remote in drained {
            remote.shutdown();
        }
    }

    /// Number of registered remotes.
    pub fn len(&self) -> usize {
        self.remotes.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.remotes.lock().is_empty()
    }

    fn require(&self, owner: &ObjectRef) -> Result<Arc<Remote>> {
        self.find(owner)
            .ok_or_else(|| Error::not_found("Remote", owner.to_string()))
    }
}
