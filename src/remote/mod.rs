//! # Remote Layer
//!
//! Bridges events from external clusters into local controllers.
//!
//! ```text
//!   Registry ── owner ObjectRef ──► Remote (one per cluster connection)
//!                                     │
//!                                     ├── Manager (hosting framework)
//!                                     │     one watch per kind, predicate = Router
//!                                     │
//!                                     ├── Watch(kind) + predicates
//!                                     │
//!                                     └── Relay ── GenericEvent{target} ──► RelaySource
//!                                                                           (local controller)
//! ```
//!
//! The hosting framework is reached only through [`Connector`], [`Manager`]
//! and [`Predicate`], so any cluster client can sit underneath.

mod cluster;
mod framework;
mod registry;
mod relay;
mod watch;

pub use cluster::{Remote, RestConfig};
pub use framework::{
    Connector, CreateEvent, DeleteEvent, Done, EventRef, GenericEvent, Manager, MatchLabels,
    Object, ObjectRef, Predicate, UpdateEvent,
};
pub use registry::Registry;
pub use relay::{Relay, RelayId, RelaySource, RELAY_CHANNEL_CAPACITY};
pub use watch::Watch;
