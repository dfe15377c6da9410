//! # Watches
//!
//! A watch delivers the events of one model kind to an [`EventHandler`], in
//! journal order, on its own thread with its own read-only connection.
//!
//! ## Snapshot + Catch-Up
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Watch Timeline                                 │
//! │                                                                         │
//! │  Client::watch                                                          │
//! │  (write lock held)        start()                                       │
//! │       │                      │                                          │
//! │       ▼                      ▼                                          │
//! │  cursor = committed ID   ┌──────────────────┐  ┌────────────────────┐   │
//! │  snapshot = list rows    │ Phase 1          │  │ Phase 2            │   │
//! │                          │ snapshot rows as │  │ on every wake:     │   │
//! │                          │ Created (id = 0) │  │ page history where │   │
//! │                          └──────────────────┘  │ id > cursor        │   │
//! │                                                └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The snapshot and the cursor are taken while writers are excluded, so every
//! change after the snapshot is in history above the cursor and no change
//! before it is delivered twice.
//!
//! ## Ending
//!
//! Ending drops the wake sender. The thread finishes the wakes already queued,
//! each of which drains history, then calls [`EventHandler::end`] and exits.
//! Ending twice is a no-op.
//!
//! A watch ended before it started never spawns a thread. Its handler gets
//! `end` when the watch is ended through the handle, or when `start` or drop
//! finds it ended, and `start` then fails with `Error::Closed`.

use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

use super::client::open_read_only;
use super::journal::EventHistory;
use super::predicate::{ListOptions, Page, Predicate};
use super::table::Table;
use super::{Action, Event, Model};
use crate::error::ResultExt;
use crate::{Error, Result};

// =============================================================================
// Handler
// =============================================================================

/// Receives the events of one watch.
///
/// Called from the watch thread, one call at a time, in journal order.
pub trait EventHandler<M>: Send + 'static {
    /// A model was created (also used for snapshot rows).
    fn created(&mut self, event: Event<M>);

    /// A model was updated. `event.updated` holds the new state.
    fn updated(&mut self, event: Event<M>);

    /// A model was deleted.
    fn deleted(&mut self, event: Event<M>);

    /// Delivery failed. The watch keeps running.
    fn error(&mut self, err: Error) {
        warn!(error = %err, "watch delivery failed");
    }

    /// The watch ended. Called once, last.
    fn end(&mut self) {}
}

// =============================================================================
// Signal
// =============================================================================

/// Where a watch thread reads history from.
#[derive(Debug, Clone)]
pub(crate) struct WatchSource {
    pub(crate) path: PathBuf,
    pub(crate) page_limit: usize,
    pub(crate) busy_timeout: Duration,
}

/// The journal's side of a watch.
pub(crate) struct WatchSignal {
    pub(crate) id: u64,
    pub(crate) kind: &'static str,
    sender: Mutex<Option<SyncSender<()>>>,
}

impl WatchSignal {
    pub(crate) fn new(id: u64, kind: &'static str, capacity: usize) -> (Arc<Self>, Receiver<()>) {
        let (tx, rx) = sync_channel(capacity);
        let signal = Arc::new(Self {
            id,
            kind,
            sender: Mutex::new(Some(tx)),
        });
        (signal, rx)
    }

    /// Queues a wake unless one is already pending or the watch ended.
    pub(crate) fn notify(&self) {
        if let Some(tx) = self.sender.lock().as_ref() {
            // Full means a wake is already queued.
            let _ = tx.try_send(());
        }
    }

    /// Drops the sender. Returns false when already ended.
    pub(crate) fn end(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.sender.lock().is_none()
    }
}

// =============================================================================
// Watch
// =============================================================================

/// A registered watch of model `M`.
///
/// Dropping the handle of a started watch leaves it running until it is ended
/// through the journal or the client closes. Dropping an unstarted watch ends
/// it.
pub struct Watch<M: Model> {
    signal: Arc<WatchSignal>,
    /// The delivery loop until it moves to its thread, or is ended unstarted.
    pending: Mutex<Option<Delivery<M>>>,
    thread: Option<JoinHandle<()>>,
}

impl<M: Model> Watch<M> {
    pub(crate) fn new(
        signal: Arc<WatchSignal>,
        handler: Box<dyn EventHandler<M>>,
        rx: Receiver<()>,
        cursor: i64,
        source: WatchSource,
    ) -> Self {
        Self {
            pending: Mutex::new(Some(Delivery {
                id: signal.id,
                kind: signal.kind,
                handler,
                rx,
                cursor,
                source,
            })),
            signal,
            thread: None,
        }
    }

    /// Watch ID, unique within its journal.
    pub fn id(&self) -> u64 {
        self.signal.id
    }

    /// Watched model kind.
    pub fn kind(&self) -> &'static str {
        self.signal.kind
    }

    /// True once the delivery thread has been spawned.
    pub fn is_started(&self) -> bool {
        self.thread.is_some()
    }

    /// True once ended.
    pub fn is_ended(&self) -> bool {
        self.signal.is_ended()
    }

    /// Starts delivery. `snapshot` is delivered first as `Created` events
    /// with ID 0. Starting twice is a no-op.
    ///
    /// # Errors
    ///
    /// `Error::Closed` when the watch was ended before it started.
    pub fn start(&mut self, snapshot: Vec<M>) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let closed = || Error::Closed(format!("watch {} ended before start", self.signal.id));
        if self.signal.is_ended() {
            self.finish_unstarted();
            return Err(closed());
        }
        let Some(delivery) = self.pending.lock().take() else {
            return Err(closed());
        };
        let name = format!("ctrlkit-watch-{}-{}", delivery.kind, delivery.id);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || delivery.run(snapshot))
            .with_context(|| format!("spawn watch {}", self.signal.id))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Ends the watch. The journal drops it on its next pass.
    pub fn end(&self) {
        if self.signal.end() {
            debug!(watch = self.signal.id, kind = self.signal.kind, "watch ended");
        }
        self.finish_unstarted();
    }

    /// Waits for the delivery thread to finish. Only returns after the watch
    /// has been ended.
    ///
    /// # Errors
    ///
    /// `Error::Panicked` with the panic message when the handler panicked.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Error::Panicked(format!("watch {}: {message}", self.signal.id))
            }),
            None => Ok(()),
        }
    }

    /// Ends the handler of a watch that never started.
    fn finish_unstarted(&self) {
        if self.thread.is_some() || !self.signal.is_ended() {
            return;
        }
        if let Some(mut delivery) = self.pending.lock().take() {
            delivery.handler.end();
        }
    }
}

#[cfg(test)]
impl<M: Model> Watch<M> {
    /// Drains the wakes queued for an unstarted watch.
    pub(crate) fn take_wakes(&self) -> usize {
        self.pending
            .lock()
            .as_ref()
            .map_or(0, |delivery| delivery.rx.try_iter().count())
    }
}

impl<M: Model> Drop for Watch<M> {
    fn drop(&mut self) {
        if self.thread.is_none() {
            self.signal.end();
            self.finish_unstarted();
        }
    }
}

impl<M: Model> fmt::Debug for Watch<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.signal.id)
            .field("kind", &self.signal.kind)
            .field("started", &self.is_started())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// =============================================================================
// Delivery Loop
// =============================================================================

struct Delivery<M> {
    id: u64,
    kind: &'static str,
    handler: Box<dyn EventHandler<M>>,
    rx: Receiver<()>,
    cursor: i64,
    source: WatchSource,
}

impl<M: Model> Delivery<M> {
    fn run(mut self, snapshot: Vec<M>) {
        debug!(watch = self.id, kind = self.kind, snapshot = snapshot.len(), "watch started");
        for model in snapshot {
            self.handler.created(Event {
                id: 0,
                action: Action::Created,
                model,
                updated: None,
            });
        }

        let mut conn = None;
        while self.rx.recv().is_ok() {
            self.drain(&mut conn);
        }

        self.handler.end();
        debug!(watch = self.id, kind = self.kind, cursor = self.cursor, "watch stopped");
    }

    /// Delivers every committed row above the cursor, one page at a time.
    fn drain(&mut self, conn: &mut Option<Connection>) {
        if conn.is_none() {
            match open_read_only(&self.source.path, self.source.busy_timeout) {
                Ok(c) => *conn = Some(c),
                Err(err) => {
                    self.handler.error(err);
                    return;
                }
            }
        }
        let Some(conn) = conn.as_ref() else {
            return;
        };

        let limit = self.source.page_limit.max(1);
        loop {
            let options = ListOptions::filter(Predicate::and([
                Predicate::gt("id", self.cursor),
                Predicate::eq("kind", self.kind),
            ]))
            .with_page(Page::new(0, limit));
            let page: Vec<EventHistory> = match Table::new(conn).list(&options) {
                Ok(page) => page,
                Err(err) => {
                    self.handler.error(err);
                    return;
                }
            };
            let fetched = page.len();
            for history in page {
                self.cursor = history.id;
                match decode::<M>(history) {
                    Ok(event) => self.dispatch(event),
                    Err(err) => self.handler.error(err),
                }
            }
            if fetched < limit {
                return;
            }
        }
    }

    fn dispatch(&mut self, event: Event<M>) {
        match event.action {
            Action::Created => self.handler.created(event),
            Action::Updated => self.handler.updated(event),
            Action::Deleted => self.handler.deleted(event),
        }
    }
}

fn decode<M: Model>(history: EventHistory) -> Result<Event<M>> {
    let context = || format!("decode history {} of {}", history.id, history.kind);
    let model = serde_json::from_str(&history.model).with_context(context)?;
    let updated = history
        .updated
        .as_deref()
        .map(serde_json::from_str::<M>)
        .transpose()
        .with_context(context)?;
    if history.action == Action::Updated && updated.is_none() {
        return Err(Error::Schema(format!(
            "history {} records an update of '{}' without the new state",
            history.id, history.kind
        )));
    }
    Ok(Event {
        id: history.id,
        action: history.action,
        model,
        updated,
    })
}
