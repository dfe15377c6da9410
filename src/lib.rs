//! # ctrlkit - Controller Toolkit
//!
//! ctrlkit is the state and event plumbing for reconciliation controllers. It
//! provides:
//!
//! - **Typed local store**: declared models mapped onto SQLite tables, with
//!   labels, predicates, paging and serializable transactions
//! - **Durable event journal**: every committed mutation recorded in one
//!   global order while anyone is watching
//! - **Model watches**: snapshot plus live Created/Updated/Deleted delivery to
//!   a handler on its own thread
//! - **Remote relays**: events from external clusters turned into generic
//!   events on local targets, with hot-swappable cluster connections
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Client                                 │
//! │        (get, list, insert, update, delete, begin, watch)        │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │ write gate                      │ read pool
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐   ┌─────────────────────────────┐
//! │ writer connection             │   │ read-only connections       │
//! │  row + labels + EventHistory  │   │  (WAL snapshot reads)       │
//! │  in one SQLite transaction    │   └─────────────────────────────┘
//! └───────────────┬───────────────┘
//!                 │ commit → Journal::committed()
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Watch threads: page EventHistory by id, decode, call handler   │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Registry → Remote → Manager(kind, Router) → Relay → Source     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One writer**: at most one transaction or autocommit write is in flight
//! 2. **Atomic journaling**: an event row commits or rolls back with its row
//! 3. **Ordered delivery**: each watch sees events strictly in id order
//! 4. **No phantom events**: a watch never sees a rolled back mutation
//! 5. **Fire and forget relays**: a slow or closed local controller never
//!    blocks a remote event loop
//!
//! ## Module Organization
//!
//! - [`error`]: The error enum and context wrapping
//! - [`model`]: Schemas, the client, transactions, the journal and watches
//! - [`remote`]: Remote clusters, relays and the registry

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for ctrlkit operations.
pub mod error;

/// The typed local store.
///
/// Models declare a static [`Schema`](model::Schema); a [`Client`](model::Client)
/// serves a [`Catalog`](model::Catalog) of them from one SQLite file.
pub mod model;

/// Remote cluster relays.
pub mod remote;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result, ResultExt};
pub use model::{Action, Client, ClientConfig, Event, EventHandler, Model, Tx};
pub use remote::{Registry, Relay, Remote, RestConfig};
