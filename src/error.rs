//! # Error Handling for ctrlkit
//!
//! This module defines the error types used throughout ctrlkit. A single error
//! enum ([`Error`]) represents every failure mode of the model store and the
//! remote relay layer, so callers match on one type regardless of which layer
//! produced the failure.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Configuration | `Configuration` | Fix the configuration, no retry |
//! | Transaction state | `TxInvalid` | Programmer error, surfaced immediately |
//! | Store | `Store`, `Io`, `Closed` | Log and investigate; the store stays usable |
//! | Schema | `Schema`, `Codec` | Fix the model declaration |
//! | Not found | `NotFound` | Expected outcome, handle in the caller |
//! | Thread | `Panicked` | Handler bug; the thread is gone |
//!
//! ## Context Wrapping
//!
//! Errors from SQLite, serde and connectors are wrapped with call-site context
//! through [`ResultExt`] where they are first observed, and passed up
//! unchanged from there. Wrapping captures a backtrace (when enabled through
//! `RUST_BACKTRACE`) and keeps the original error reachable through
//! [`Error::root_cause`]. Wrapping an already wrapped error appends context to
//! the existing wrapper instead of nesting a second one.

use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in ctrlkit operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A component was asked to run without the configuration it needs.
    ///
    /// Starting a [`Remote`](crate::remote::Remote) with no REST configuration
    /// is the common case. Fatal to the operation, never retried internally.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `Tx::commit` or `Tx::end` was called on a transaction that is not the
    /// one currently open on its client (already finished or stale).
    #[error("transaction not valid")]
    TxInvalid,

    /// SQLite operation failed.
    ///
    /// Wraps DDL and DML failures from `rusqlite`. A failed mutation always
    /// releases the write-exclusion lock, so the store remains usable.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// No row exists for the requested primary key, or no remote is registered
    /// for the requested owner.
    #[error("{kind} '{key}' not found")]
    NotFound {
        /// Table name or resource kind that was searched.
        kind: String,
        /// Primary key or owner identity that was not found.
        key: String,
    },

    /// A model schema is malformed, a predicate names an unknown field, or a
    /// value does not match its declared column type.
    #[error("schema error: {0}")]
    Schema(String),

    /// JSON encoding or decoding of a model snapshot failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Filesystem operation failed (purging the database file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The client is not open, or the watch has already ended.
    #[error("closed: {0}")]
    Closed(String),

    /// A background thread panicked. Holds the panic message.
    #[error("thread panicked: {0}")]
    Panicked(String),

    /// An error wrapped with call-site context.
    ///
    /// Created by [`ResultExt::context`]; see the module docs.
    #[error("{context}: {source}")]
    Context {
        /// Context pairs accumulated while the error propagated.
        context: String,
        /// The wrapped error.
        #[source]
        source: Box<Error>,
        /// Stack captured where the error was first wrapped.
        stack: Arc<Backtrace>,
    },
}

impl Error {
    /// Wraps this error with context.
    ///
    /// The stack is captured only on the first wrap. Later wraps append their
    /// context to the existing wrapper.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            Error::Context {
                context: existing,
                source,
                stack,
            } => Error::Context {
                context: format!("{existing}; {context}"),
                source,
                stack,
            },
            other => Error::Context {
                context,
                source: Box::new(other),
                stack: Arc::new(Backtrace::capture()),
            },
        }
    }

    /// Returns the innermost (original) error.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Returns the captured stack, if this error was wrapped.
    pub fn stack(&self) -> Option<&Backtrace> {
        match self {
            Error::Context { stack, .. } => Some(stack),
            _ => None,
        }
    }

    /// Returns true when the root cause is [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Error::NotFound { .. })
    }

    pub(crate) fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Context Extension
// =============================================================================

/// Attaches call-site context to any fallible result whose error converts
/// into [`Error`].
///
/// ```rust
/// use ctrlkit::error::{Error, ResultExt};
///
/// let failed: Result<(), Error> = Err(Error::Schema("bad field".into()));
/// let err = failed.context("open store").unwrap_err();
/// assert!(matches!(err.root_cause(), Error::Schema(_)));
/// ```
pub trait ResultExt<T> {
    /// Wraps the error with a fixed context string.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wraps the error with a lazily built context string.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().wrap(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().wrap(f()))
    }
}

// =============================================================================
// Tests
// =============================================================================
