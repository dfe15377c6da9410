//! # Change Journal
//!
//! The journal turns mutations into `EventHistory` rows and wakes watchers
//! when those rows become visible.
//!
//! ## Event IDs
//!
//! ```text
//!   committed_id        event_id
//!        │                 │
//!   ─────┼──── staged ─────┤
//!   1 2 3│4 5 6            │
//!        ▼                 ▼
//!   visible to watchers    written in the open transaction
//! ```
//!
//! IDs are assigned under the journal lock, so they form one total order
//! across every kind. A transaction stages IDs as it writes history rows.
//! `committed()` publishes them and wakes every watch; `unstage()` drops them
//! after a rollback so the next writer reuses the same IDs (the rows went with
//! the rollback).
//!
//! Nothing is recorded while no watch is registered. On open the journal
//! resumes from the highest stored ID, so reopened stores never reuse an ID.
//!
//! ## Wake Signals
//!
//! Each watch has a bounded `sync_channel` of unit wakes. `committed()` uses
//! `try_send` and ignores a full channel: a wake only says "look again", and a
//! watch that already has one queued will see the new rows on that pass.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::schema::{quote, Field, FieldType, Schema};
use super::table::Table;
use super::watch::{EventHandler, Watch, WatchSignal, WatchSource};
use super::{Action, Model};
use crate::error::ResultExt;
use crate::{Error, Result};

static EVENT_HISTORY: Schema = Schema::new(
    "EventHistory",
    &[
        Field::new("id", FieldType::Integer).pk(),
        Field::new("kind", FieldType::Text),
        Field::new("model", FieldType::Text),
        Field::new("action", FieldType::Integer),
        Field::new("updated", FieldType::Text).nullable(),
    ],
);

/// One journal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHistory {
    /// Journal ID.
    pub id: i64,
    /// Table name of the subject.
    pub kind: String,
    /// JSON of the subject (the prior state for updates).
    pub model: String,
    /// What happened.
    pub action: Action,
    /// JSON of the new state, for updates.
    pub updated: Option<String>,
}

impl Model for EventHistory {
    fn schema() -> &'static Schema {
        &EVENT_HISTORY
    }
}

// =============================================================================
// Journal
// =============================================================================

struct JournalState {
    watches: Vec<Arc<WatchSignal>>,
    /// Highest ID written, including staged rows.
    event_id: i64,
    /// Highest ID known committed.
    committed_id: i64,
    next_watch: u64,
    notify_capacity: usize,
    /// Where watch threads read from. `None` while the store is closed.
    source: Option<WatchSource>,
}

/// Event journal and watch registry of one [`Client`](super::Client).
pub struct Journal {
    state: Mutex<JournalState>,
}

impl Journal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(JournalState {
                watches: Vec::new(),
                event_id: 0,
                committed_id: 0,
                next_watch: 0,
                notify_capacity: 1,
                source: None,
            }),
        }
    }

    /// Attaches the journal to an open store whose history ends at `last_id`.
    pub(crate) fn open(&self, source: WatchSource, notify_capacity: usize, last_id: i64) {
        let mut state = self.state.lock();
        state.event_id = last_id;
        state.committed_id = last_id;
        state.notify_capacity = notify_capacity.max(1);
        state.source = Some(source);
        debug!(last_id, "journal opened");
    }

    /// Ends every watch and detaches from the store.
    pub(crate) fn close(&self) {
        self.end_all();
        self.state.lock().source = None;
    }

    /// Registers a watch of `M` positioned at the current committed ID.
    ///
    /// The watch is not delivering until [`Watch::start`] is called.
    /// [`Client::watch`](super::Client::watch) does both and also delivers a
    /// snapshot of the current rows.
    ///
    /// # Errors
    ///
    /// `Error::Closed` when the store is not open.
    pub fn watch<M, H>(&self, handler: H) -> Result<Watch<M>>
    where
        M: Model,
        H: EventHandler<M>,
    {
        let mut state = self.state.lock();
        let source = state
            .source
            .clone()
            .ok_or_else(|| Error::Closed("journal is not open".to_string()))?;
        state.next_watch += 1;
        let (signal, rx) = WatchSignal::new(state.next_watch, M::schema().name, state.notify_capacity);
        state.watches.push(Arc::clone(&signal));
        debug!(watch = signal.id, kind = signal.kind, cursor = state.committed_id, "watch registered");
        Ok(Watch::new(signal, Box::new(handler), rx, state.committed_id, source))
    }

    /// Deregisters and ends a watch. Returns false when it was not live.
    pub fn end(&self, watch_id: u64) -> bool {
        let mut state = self.state.lock();
        let mut ended = false;
        state.watches.retain(|w| {
            if w.id == watch_id {
                ended = w.end();
                false
            } else {
                true
            }
        });
        ended
    }

    /// Deregisters and ends every watch.
    pub fn end_all(&self) {
        let mut state = self.state.lock();
        for w in state.watches.drain(..) {
            w.end();
        }
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        let state = self.state.lock();
        state.watches.iter().filter(|w| !w.is_ended()).count()
    }

    /// Highest committed journal ID.
    pub fn event_id(&self) -> i64 {
        self.state.lock().committed_id
    }

    /// Records a creation in the caller's transaction.
    pub fn created<M: Model>(&self, conn: &Connection, model: &M) -> Result<()> {
        self.record(conn, Action::Created, model, None)
    }

    /// Records an update (`model` before, `updated` after).
    pub fn updated<M: Model>(&self, conn: &Connection, model: &M, updated: &M) -> Result<()> {
        self.record(conn, Action::Updated, model, Some(updated))
    }

    /// Records a deletion.
    pub fn deleted<M: Model>(&self, conn: &Connection, model: &M) -> Result<()> {
        self.record(conn, Action::Deleted, model, None)
    }

    fn record<M: Model>(
        &self,
        conn: &Connection,
        action: Action,
        model: &M,
        updated: Option<&M>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.watches.retain(|w| !w.is_ended());
        if state.watches.is_empty() {
            return Ok(());
        }
        let kind = M::schema().name;
        let context = || format!("journal {action} of {kind}");
        let row = EventHistory {
            id: state.event_id + 1,
            kind: kind.to_string(),
            model: serde_json::to_string(model).with_context(context)?,
            action,
            updated: updated
                .map(serde_json::to_string)
                .transpose()
                .with_context(context)?,
        };
        Table::new(conn).insert(&row)?;
        state.event_id = row.id;
        Ok(())
    }

    /// Publishes staged IDs and wakes every watch. Never blocks on a watcher.
    pub fn committed(&self) {
        let mut state = self.state.lock();
        state.committed_id = state.event_id;
        state.watches.retain(|w| !w.is_ended());
        for w in &state.watches {
            w.notify();
        }
    }

    /// Discards staged IDs after a rollback.
    pub fn unstage(&self) {
        let mut state = self.state.lock();
        state.event_id = state.committed_id;
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Journal")
            .field("watches", &state.watches.len())
            .field("event_id", &state.event_id)
            .field("committed_id", &state.committed_id)
            .finish()
    }
}

/// Highest stored history ID, 0 for an empty store.
pub(crate) fn last_event_id(conn: &Connection) -> Result<i64> {
    let sql = format!(
        "SELECT COALESCE(MAX(\"id\"), 0) FROM {}",
        quote(EVENT_HISTORY.name)
    );
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

// =============================================================================
// Tests
// =============================================================================
