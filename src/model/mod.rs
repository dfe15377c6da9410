//! # Model Store
//!
//! An embedded, transactional object store on a single SQLite file, with a
//! change journal that feeds any number of independent watchers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Model Store                               │
//! │                                                                      │
//! │  Client::insert ──► Table (SQL) ──► labels ──► Journal::created      │
//! │                                                   │                  │
//! │                                        EventHistory row (id = n)     │
//! │                                                   │                  │
//! │  COMMIT ──────────────────────────────► Journal::committed           │
//! │                                                   │ try_send(())     │
//! │                         ┌─────────────────────────┼──────────┐       │
//! │                         ▼                         ▼          ▼       │
//! │                   watch thread A            watch thread B  ...      │
//! │                   (read-only conn)          (read-only conn)         │
//! │                   id > cursor AND kind = A                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Declaring Models
//!
//! A model is a plain serde struct with a static [`Schema`]. Field names in the
//! schema must match the serialized field names.
//!
//! ```rust
//! use ctrlkit::model::{Field, FieldType, Model, Schema};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Person {
//!     id: i64,
//!     name: String,
//! }
//!
//! static PERSON: Schema = Schema::new(
//!     "Person",
//!     &[
//!         Field::new("id", FieldType::Integer).pk(),
//!         Field::new("name", FieldType::Text),
//!     ],
//! );
//!
//! impl Model for Person {
//!     fn schema() -> &'static Schema {
//!         &PERSON
//!     }
//! }
//!
//! let p = Person { id: 7, name: "ada".into() };
//! assert_eq!(p.pk(), "7");
//! assert_eq!(p.describe(), "Person(7)");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

mod client;
mod journal;
mod label;
mod predicate;
mod schema;
mod table;
mod watch;

pub use client::{Client, ClientConfig, Tx};
pub use client::{DEFAULT_BUSY_TIMEOUT, DEFAULT_NOTIFY_CAPACITY, DEFAULT_PAGE_LIMIT};
pub use journal::{EventHistory, Journal};
pub use label::Label;
pub use predicate::{ListOptions, Page, Predicate, Value};
pub use schema::{Catalog, Field, FieldType, ForeignKey, Schema, SCHEMA_VERSION};
pub use table::Table;
pub use watch::{EventHandler, Watch};

// =============================================================================
// Model
// =============================================================================

/// Label set attached to a model.
pub type Labels = BTreeMap<String, String>;

/// A record type stored in its own table.
///
/// Implementors supply the static schema. Everything else has a default
/// derived from the schema and the serde encoding.
pub trait Model: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static {
    /// The static table declaration for this model.
    fn schema() -> &'static Schema;

    /// Primary key as a string. Composite keys are joined with `/`.
    ///
    /// Empty (and logged) when the model fails to serialize. The store never
    /// keys rows by this string; it encodes the key itself and fails instead.
    fn pk(&self) -> String {
        let value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(err) => {
                warn!(kind = Self::schema().name, error = %err, "model does not serialize; empty primary key");
                return String::new();
            }
        };
        Self::schema()
            .pk_fields()
            .map(|f| table::key_text(value.get(f.name)))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Human readable description, used in log lines and error messages.
    fn describe(&self) -> String {
        format!("{}({})", Self::schema().name, self.pk())
    }

    /// Labels stored in the `Label` side table. `None` means unlabeled.
    fn labels(&self) -> Option<Labels> {
        None
    }
}

// =============================================================================
// Events
// =============================================================================

/// What happened to a model.
///
/// Stored in `EventHistory.action` as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    /// A row was inserted.
    Created = 0x01,
    /// A row was updated.
    Updated = 0x02,
    /// A row was deleted.
    Deleted = 0x04,
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Action::Created),
            0x02 => Ok(Action::Updated),
            0x04 => Ok(Action::Deleted),
            other => Err(format!("unknown action code {other:#04x}")),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A typed model event delivered to an [`EventHandler`].
///
/// Snapshot events delivered when a watch starts carry `id == 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<M> {
    /// Journal ID of the history row.
    pub id: i64,
    /// The action recorded.
    pub action: Action,
    /// The subject. For updates this is the state before the change.
    pub model: M,
    /// The state after an update.
    pub updated: Option<M>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_codes() {
        assert_eq!(u8::from(Action::Created), 1);
        assert_eq!(u8::from(Action::Updated), 2);
        assert_eq!(u8::from(Action::Deleted), 4);
        assert_eq!(Action::try_from(4u8), Ok(Action::Deleted));
        assert!(Action::try_from(3u8).is_err());
    }

    #[test]
    fn test_action_serde() {
        let json = serde_json::to_string(&Action::Updated).unwrap();
        assert_eq!(json, "2");
        let back: Action = serde_json::from_str("1").unwrap();
        assert_eq!(back, Action::Created);
    }
}
