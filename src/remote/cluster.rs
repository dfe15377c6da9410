//! # Remote Clusters
//!
//! A [`Remote`] is one connection to an external cluster together with the
//! watches and relays riding on it.
//!
//! ## Lifecycle
//!
//! ```text
//!            start()                        shutdown()
//!   stopped ─────────► started ───────────────────────► stopped
//!      │   connect, one manager watch per kind,   done signal fired,
//!      │   Router as the only predicate,          relays closed,
//!      │   manager loop started                   watches marked unstarted
//!      │
//!      └── ensure_watch / ensure_relay work in either state; on a started
//!          remote a new kind is registered with the manager immediately.
//! ```
//!
//! ## Locking
//!
//! Two locks, always taken in this order:
//!
//! 1. `lifecycle` serializes start, shutdown and every change to the routes.
//! 2. `routes` is read by the router on every event and written only briefly.
//!
//! The manager is never called with `routes` held, since a manager may deliver
//! events (and so enter the router) from inside `watch`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use super::framework::{Connector, Done, Manager, Predicate};
use super::relay::{Relay, RelayId, Router, Routes};
use super::watch::Watch;
use crate::error::ResultExt;
use crate::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Connection parameters for a cluster API server.
///
/// Two remotes are the same connection exactly when these are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestConfig {
    /// API server URL.
    pub host: String,
    /// Bearer token.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// PEM encoded CA bundle.
    #[serde(default)]
    pub ca_data: Option<String>,
    /// Skip TLS verification.
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl RestConfig {
    /// Config for `host` with no credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Sets the bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

// =============================================================================
// Remote
// =============================================================================

#[derive(Default)]
struct Lifecycle {
    started: bool,
    manager: Option<Box<dyn Manager>>,
    done: Option<watch::Sender<bool>>,
    router: Option<Arc<dyn Predicate>>,
}

/// One external cluster.
pub struct Remote {
    name: String,
    config: Option<RestConfig>,
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<Lifecycle>,
    routes: Arc<RwLock<Routes>>,
}

impl Remote {
    /// A stopped remote. `config` may be `None` for a remote that only
    /// collects watches and relays until it is replaced.
    pub fn new(
        name: impl Into<String>,
        config: Option<RestConfig>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            connector,
            lifecycle: Mutex::new(Lifecycle::default()),
            routes: Arc::new(RwLock::new(Routes::default())),
        }
    }

    /// Name, used for the manager and in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection parameters.
    pub fn config(&self) -> Option<&RestConfig> {
        self.config.as_ref()
    }

    /// Same connection parameters.
    pub fn equals(&self, other: &Remote) -> bool {
        self.config == other.config
    }

    /// True between a successful `start` and `shutdown`.
    pub fn is_started(&self) -> bool {
        self.lifecycle.lock().started
    }

    /// Watched kinds, in registration order.
    pub fn watch_kinds(&self) -> Vec<String> {
        self.routes
            .read()
            .watches
            .iter()
            .map(|w| w.kind().to_string())
            .collect()
    }

    /// The remote-level watch for `kind`, if any.
    pub fn watch_for(&self, kind: &str) -> Option<Watch> {
        self.routes
            .read()
            .watches
            .iter()
            .find(|w| w.matches(kind))
            .cloned()
    }

    /// Installed relays.
    pub fn relay_ids(&self) -> Vec<RelayId> {
        self.routes.read().relays.iter().map(Relay::id).collect()
    }

    /// Connects and starts watching every registered kind. Starting a started
    /// remote is a no-op.
    ///
    /// # Errors
    ///
    /// `Error::Configuration` without a `RestConfig`; connector and manager
    /// errors are wrapped with the remote name and leave the remote stopped.
    pub fn start(&self) -> Result<()> {
        // Held across connect and the manager calls: a concurrent start or
        // shutdown must not observe a half-built manager.
        let mut life = self.lifecycle.lock();
        if life.started {
            return Ok(());
        }
        let config = self.config.as_ref().ok_or_else(|| {
            Error::Configuration(format!("remote '{}' has no REST configuration", self.name))
        })?;

        let mut manager = self
            .connector
            .connect(&self.name, config)
            .with_context(|| format!("connect remote {} at {}", self.name, config.host))?;
        let router: Arc<dyn Predicate> = Arc::new(Router::new(Arc::clone(&self.routes)));
        let kinds = self.watch_kinds();
        for kind in &kinds {
            manager
                .watch(kind, Arc::clone(&router))
                .with_context(|| format!("watch {kind} on remote {}", self.name))?;
        }
        let (done_tx, done_rx) = watch::channel(false);
        manager
            .start(Done::new(done_rx))
            .with_context(|| format!("start manager of remote {}", self.name))?;

        {
            let mut routes = self.routes.write();
            for w in routes.watches.iter_mut() {
                w.started = kinds.iter().any(|k| w.matches(k));
            }
        }
        *life = Lifecycle {
            started: true,
            manager: Some(manager),
            done: Some(done_tx),
            router: Some(router),
        };
        info!(remote = %self.name, host = %config.host, kinds = kinds.len(), "remote started");
        Ok(())
    }

    /// Stops the manager loop and closes every relay. Idempotent.
    pub fn shutdown(&self) {
        let mut life = self.lifecycle.lock();
        {
            let mut routes = self.routes.write();
            for relay in &routes.relays {
                relay.shutdown();
            }
            for w in routes.watches.iter_mut() {
                w.started = false;
            }
        }
        let was_started = life.started;
        if let Some(done) = life.done.take() {
            // No receiver left means the loop already exited.
            let _ = done.send(true);
        }
        *life = Lifecycle::default();
        if was_started {
            info!(remote = %self.name, "remote shut down");
        }
    }

    /// Ensures a watch for the kind exists, merging predicates into an
    /// existing one. On a started remote a new kind starts immediately.
    pub fn ensure_watch(&self, watch: Watch) -> Result<()> {
        let mut life = self.lifecycle.lock();
        self.ensure_watch_locked(&mut life, watch)
    }

    /// Installs a relay, or replaces the watch list of the relay with the same
    /// id. Every kind the relay subscribes to gets a remote-level watch.
    pub fn ensure_relay(&self, relay: Relay) -> Result<()> {
        let mut life = self.lifecycle.lock();
        let kinds = relay.kinds();
        {
            let mut routes = self.routes.write();
            match routes.relays.iter_mut().find(|r| r.id() == relay.id()) {
                Some(existing) => {
                    *existing = relay;
                    debug!(remote = %self.name, relay = %existing.id(), "relay updated");
                }
                None => {
                    debug!(remote = %self.name, relay = %relay.id(), to = %relay.target(), "relay installed");
                    routes.relays.push(relay);
                }
            }
        }
        for kind in kinds {
            self.ensure_watch_locked(&mut life, Watch::new(kind))?;
        }
        Ok(())
    }

    /// Removes a relay and closes its channel. Returns false when unknown.
    pub fn end_relay(&self, id: RelayId) -> bool {
        let _life = self.lifecycle.lock();
        let removed = {
            let mut routes = self.routes.write();
            let index = routes.relays.iter().position(|r| r.id() == id);
            index.map(|i| routes.relays.remove(i))
        };
        match removed {
            Some(relay) => {
                relay.shutdown();
                debug!(remote = %self.name, relay = %id, "relay ended");
                true
            }
            None => false,
        }
    }

    /// Moves every watch and relay of `other` onto this remote and leaves
    /// `other` empty. Moved watches re-attach here if this remote is started.
    pub fn take_workload(&self, other: &Remote) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let (watches, relays) = {
            let _life = other.lifecycle.lock();
            let mut routes = other.routes.write();
            (
                std::mem::take(&mut routes.watches),
                std::mem::take(&mut routes.relays),
            )
        };
        let moved = (watches.len(), relays.len());
        for mut watch in watches {
            watch.started = false;
            self.ensure_watch(watch)?;
        }
        for relay in relays {
            self.ensure_relay(relay)?;
        }
        info!(
            from = %other.name,
            to = %self.name,
            watches = moved.0,
            relays = moved.1,
            "workload transferred"
        );
        Ok(())
    }

    /// Forgets every watch and relay without closing anything.
    pub fn reset(&self) {
        let _life = self.lifecycle.lock();
        let mut routes = self.routes.write();
        routes.watches.clear();
        routes.relays.clear();
    }

    fn ensure_watch_locked(&self, life: &mut Lifecycle, watch: Watch) -> Result<()> {
        let kind = watch.kind().to_string();
        let needs_start = {
            let mut routes = self.routes.write();
            match routes.watches.iter_mut().find(|w| w.matches(&kind)) {
                Some(existing) => {
                    existing.merge(&watch);
                    life.started && !existing.started
                }
                None => {
                    let mut watch = watch;
                    watch.started = false;
                    routes.watches.push(watch);
                    debug!(remote = %self.name, kind = %kind, "watch added");
                    life.started
                }
            }
        };
        if !needs_start {
            return Ok(());
        }
        let (Some(manager), Some(router)) = (life.manager.as_mut(), life.router.as_ref()) else {
            return Ok(());
        };
        // The lifecycle lock stays held so shutdown cannot drop the manager
        // mid-registration; only `routes` must be free here.
        manager
            .watch(&kind, Arc::clone(router))
            .with_context(|| format!("watch {kind} on remote {}", self.name))?;
        if let Some(w) = self
            .routes
            .write()
            .watches
            .iter_mut()
            .find(|w| w.matches(&kind))
        {
            w.started = true;
        }
        Ok(())
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.read();
        f.debug_struct("Remote")
            .field("name", &self.name)
            .field("host", &self.config.as_ref().map(|c| c.host.as_str()))
            .field("watches", &routes.watches)
            .field("relays", &routes.relays.len())
            .finish()
    }
}
