//! # Client
//!
//! The entry point of the model store: one writer connection, a pool of
//! read-only connections, the journal, and transactions.
//!
//! ## Write Exclusion
//!
//! SQLite allows one writer. Every mutation, transaction and watch start holds
//! the write gate, a lock that a [`Tx`] keeps for its whole lifetime.
//!
//! ```text
//!   Client::insert                 Client::begin ──► Tx ───────────► commit/end
//!   ┌─────────────────────┐        ┌──────────────────────────────────────────┐
//!   │ gate ─► state lock  │        │ gate held ........................ drop  │
//!   │ BEGIN IMMEDIATE     │        │   tx.insert: state lock, SAVEPOINT, ...  │
//!   │ row, labels, history│        │   tx.update: state lock, SAVEPOINT, ...  │
//!   │ COMMIT ─► notify    │        │ COMMIT ─► notify once                    │
//!   └─────────────────────┘        └──────────────────────────────────────────┘
//! ```
//!
//! The gate is always taken before the state lock. Operations on an open `Tx`
//! take only the state lock, so they run while autocommit callers wait on the
//! gate.
//!
//! A thread holding an open `Tx` must write through it: calling an autocommit
//! mutation or `begin` on the same client from that thread waits for the gate
//! forever.
//!
//! ## Reads
//!
//! `get`, `list` and `count` run on pooled read-only connections. In WAL mode
//! they see the last committed state and never wait for the writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info, warn};

use super::journal::{last_event_id, Journal};
use super::label;
use super::predicate::{ListOptions, Predicate, Value};
use super::schema::{self, Catalog};
use super::table::Table;
use super::watch::{EventHandler, Watch, WatchSource};
use super::Model;
use crate::error::ResultExt;
use crate::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Default store file.
pub const DEFAULT_PATH: &str = "ctrlkit.db";

/// Default number of history rows a watch reads per query.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Default depth of each watch's wake queue.
///
/// Wakes carry no data, so a small queue is enough: a full queue already
/// guarantees another pass.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 3;

/// Default time a connection waits on a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle read-only connections kept for reuse.
const MAX_IDLE_READERS: usize = 4;

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Store file.
    pub path: PathBuf,

    /// History rows read per watch query.
    pub page_limit: usize,

    /// Wake queue depth per watch.
    pub notify_capacity: usize,

    /// SQLite busy timeout for every connection.
    pub busy_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_PATH),
            page_limit: DEFAULT_PAGE_LIMIT,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Defaults with the given store file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Sets the watch page size (minimum 1).
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    /// Sets the wake queue depth (minimum 1).
    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity.max(1);
        self
    }

    /// Sets the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

// =============================================================================
// Write Gate
// =============================================================================

/// A lock whose guard can outlive the borrow that took it.
struct WriteGate {
    held: Mutex<bool>,
    cv: Condvar,
}

impl WriteGate {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn acquire(self: &Arc<Self>) -> WritePermit {
        let mut held = self.held.lock();
        while *held {
            self.cv.wait(&mut held);
        }
        *held = true;
        WritePermit {
            gate: Arc::clone(self),
        }
    }
}

/// Releases the gate on drop.
struct WritePermit {
    gate: Arc<WriteGate>,
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        *self.gate.held.lock() = false;
        self.gate.cv.notify_one();
    }
}

// =============================================================================
// Readers
// =============================================================================

/// Opens a read-only connection that never takes the write lock.
pub(crate) fn open_read_only(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let context = || format!("open reader {}", path.display());
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(context)?;
    conn.busy_timeout(busy_timeout).with_context(context)?;
    Ok(conn)
}

struct ReadPool {
    /// `None` while the store is closed.
    path: Option<PathBuf>,
    idle: Vec<Connection>,
}

// =============================================================================
// Client
// =============================================================================

struct State {
    writer: Option<Connection>,
    /// ID of the open transaction.
    tx: Option<u64>,
    next_tx: u64,
}

struct Inner {
    config: ClientConfig,
    catalog: Catalog,
    state: Mutex<State>,
    gate: Arc<WriteGate>,
    journal: Journal,
    readers: Mutex<ReadPool>,
}

/// Handle to a model store. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Creates a closed client serving the models in `catalog`.
    pub fn new(config: ClientConfig, catalog: Catalog) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                state: Mutex::new(State {
                    writer: None,
                    tx: None,
                    next_tx: 0,
                }),
                gate: Arc::new(WriteGate::new()),
                journal: Journal::new(),
                readers: Mutex::new(ReadPool {
                    path: None,
                    idle: Vec::new(),
                }),
            }),
        }
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The journal.
    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    /// Returns true while open.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().writer.is_some()
    }

    /// Opens the store and builds the schema. With `purge`, the store file
    /// and its WAL/SHM files are deleted first. Opening an open client is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `Error::Store` when the file cannot be opened or the DDL fails, in
    /// which case the client stays closed.
    pub fn open(&self, purge: bool) -> Result<()> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        if state.writer.is_some() {
            return Ok(());
        }
        if purge {
            purge_files(&config.path)?;
        }

        let conn = Connection::open(&config.path)
            .with_context(|| format!("open store {}", config.path.display()))?;
        schema::initialize(&conn, &self.inner.catalog, config.busy_timeout)
            .with_context(|| format!("initialize store {}", config.path.display()))?;
        let last_id = last_event_id(&conn)
            .with_context(|| format!("read journal position {}", config.path.display()))?;

        self.inner.journal.open(
            WatchSource {
                path: config.path.clone(),
                page_limit: config.page_limit.max(1),
                busy_timeout: config.busy_timeout,
            },
            config.notify_capacity,
            last_id,
        );
        {
            let mut readers = self.inner.readers.lock();
            readers.path = Some(config.path.clone());
            readers.idle.clear();
        }
        state.writer = Some(conn);
        state.tx = None;

        info!(
            path = %config.path.display(),
            purge,
            last_event_id = last_id,
            models = self.inner.catalog.schemas().len(),
            "store opened"
        );
        Ok(())
    }

    /// Ends every watch and closes the store. With `purge`, the store files
    /// are deleted. Closing a closed client is a no-op.
    pub fn close(&self, purge: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(conn) = state.writer.take() else {
            return Ok(());
        };
        state.tx = None;
        self.inner.journal.close();
        {
            let mut readers = self.inner.readers.lock();
            readers.path = None;
            readers.idle.clear();
        }
        conn.close()
            .map_err(|(_, err)| err)
            .with_context(|| format!("close store {}", self.inner.config.path.display()))?;
        if purge {
            purge_files(&self.inner.config.path)?;
        }
        info!(path = %self.inner.config.path.display(), purge, "store closed");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetches a committed row by primary key values.
    pub fn get<M: Model>(&self, key: &[Value]) -> Result<M> {
        self.check::<M>()?;
        self.with_reader(|conn| Table::new(conn).get(key))
    }

    /// Fetches the committed row with the same key as `model`.
    pub fn find<M: Model>(&self, model: &M) -> Result<M> {
        self.check::<M>()?;
        self.with_reader(|conn| Table::new(conn).find(model))
    }

    /// Lists committed rows.
    pub fn list<M: Model>(&self, options: &ListOptions) -> Result<Vec<M>> {
        self.check::<M>()?;
        self.with_reader(|conn| Table::new(conn).list(options))
    }

    /// Counts committed rows.
    pub fn count<M: Model>(&self, predicate: Option<&Predicate>) -> Result<i64> {
        self.check::<M>()?;
        self.with_reader(|conn| Table::new(conn).count::<M>(predicate))
    }

    // =========================================================================
    // Autocommit Writes
    // =========================================================================

    /// Inserts a model with its labels and commits.
    pub fn insert<M: Model>(&self, model: &M) -> Result<()> {
        self.autocommit::<M, _>(|conn, journal| insert_in(conn, journal, model))
    }

    /// Updates a model, replaces its labels and commits.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no row has the model's key.
    pub fn update<M: Model>(&self, model: &M) -> Result<()> {
        self.autocommit::<M, _>(|conn, journal| update_in(conn, journal, model))
    }

    /// Deletes a model and its labels and commits.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no row has the model's key.
    pub fn delete<M: Model>(&self, model: &M) -> Result<()> {
        self.autocommit::<M, _>(|conn, journal| delete_in(conn, journal, model))
    }

    // =========================================================================
    // Transactions and Watches
    // =========================================================================

    /// Begins a transaction. Blocks while another one is open.
    pub fn begin(&self) -> Result<Tx> {
        let permit = self.inner.gate.acquire();
        let mut state = self.inner.state.lock();
        let conn = state.writer.as_ref().ok_or_else(closed)?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("begin transaction")?;
        state.next_tx += 1;
        let id = state.next_tx;
        state.tx = Some(id);
        debug!(tx = id, "transaction begun");
        Ok(Tx {
            client: self.clone(),
            id,
            permit: Some(permit),
        })
    }

    /// Watches `M`: registers a watch, delivers the current rows as
    /// `Created` events, then follows the journal.
    pub fn watch<M, H>(&self, handler: H) -> Result<Watch<M>>
    where
        M: Model,
        H: EventHandler<M>,
    {
        self.check::<M>()?;
        let _permit = self.inner.gate.acquire();
        let state = self.inner.state.lock();
        let conn = state.writer.as_ref().ok_or_else(closed)?;
        let journal = &self.inner.journal;

        let mut watch = journal.watch::<M, H>(handler)?;
        let snapshot = match Table::new(conn).list::<M>(&ListOptions::default()) {
            Ok(rows) => rows,
            Err(err) => {
                journal.end(watch.id());
                return Err(err);
            }
        };
        if let Err(err) = watch.start(snapshot) {
            journal.end(watch.id());
            return Err(err);
        }
        Ok(watch)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check<M: Model>(&self) -> Result<()> {
        let name = M::schema().name;
        if self.inner.catalog.contains(name) {
            Ok(())
        } else {
            Err(Error::Schema(format!("model '{name}' is not registered")))
        }
    }

    fn autocommit<M, F>(&self, op: F) -> Result<()>
    where
        M: Model,
        F: FnOnce(&Connection, &Journal) -> Result<()>,
    {
        self.check::<M>()?;
        let _permit = self.inner.gate.acquire();
        let state = self.inner.state.lock();
        let conn = state.writer.as_ref().ok_or_else(closed)?;
        let journal = &self.inner.journal;

        let name = M::schema().name;
        conn.execute_batch("BEGIN IMMEDIATE")
            .with_context(|| format!("begin write of {name}"))?;
        let result = op(conn, journal).and_then(|()| {
            conn.execute_batch("COMMIT")
                .with_context(|| format!("commit write of {name}"))
        });
        match result {
            Ok(()) => {
                journal.committed();
                Ok(())
            }
            Err(err) => {
                rollback(conn);
                journal.unstage();
                Err(err)
            }
        }
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let (conn, path) = {
            let mut readers = self.inner.readers.lock();
            let path = readers.path.clone().ok_or_else(closed)?;
            (readers.idle.pop(), path)
        };
        let conn = match conn {
            Some(conn) => conn,
            None => open_read_only(&path, self.inner.config.busy_timeout)?,
        };
        let result = f(&conn);

        let mut readers = self.inner.readers.lock();
        if readers.path.as_deref() == Some(path.as_path()) && readers.idle.len() < MAX_IDLE_READERS {
            readers.idle.push(conn);
        }
        result
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("path", &self.inner.config.path)
            .field("open", &self.is_open())
            .finish()
    }
}

fn closed() -> Error {
    Error::Closed("client is not open".to_string())
}

fn rollback(conn: &Connection) {
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        warn!(error = %err, "rollback failed");
    }
}

fn purge_files(path: &Path) -> Result<()> {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    for file in files {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(file = %file.display(), "purged"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("purge {}", file.display())),
        }
    }
    Ok(())
}

// =============================================================================
// Mutations
// =============================================================================
// Shared by autocommit and transactions. The journal write comes last, so a
// failed step never leaves a staged ID behind.

fn insert_in<M: Model>(conn: &Connection, journal: &Journal, model: &M) -> Result<()> {
    Table::new(conn).insert(model)?;
    label::insert_labels(conn, model)?;
    journal.created(conn, model)
}

fn update_in<M: Model>(conn: &Connection, journal: &Journal, model: &M) -> Result<()> {
    let table = Table::new(conn);
    let current = table.find(model)?;
    table.update(model)?;
    label::replace_labels(conn, model)?;
    journal.updated(conn, &current, model)
}

fn delete_in<M: Model>(conn: &Connection, journal: &Journal, model: &M) -> Result<()> {
    Table::new(conn).delete(model)?;
    label::delete_labels(conn, model)?;
    journal.deleted(conn, model)
}

// =============================================================================
// Transaction
// =============================================================================

/// An open transaction. Holds the write gate until committed, ended or
/// dropped. Dropping an unfinished transaction ends it.
///
/// ```rust,no_run
/// # use ctrlkit::model::{Client, Label};
/// # fn demo(client: &Client, a: &Label, b: &Label) -> ctrlkit::Result<()> {
/// let mut tx = client.begin()?;
/// tx.insert(a)?;
/// tx.insert(b)?;
/// tx.commit()?;
/// # Ok(())
/// # }
/// ```
pub struct Tx {
    client: Client,
    id: u64,
    permit: Option<WritePermit>,
}

impl Tx {
    /// Transaction ID, unique per client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inserts inside the transaction.
    pub fn insert<M: Model>(&self, model: &M) -> Result<()> {
        self.run::<M, _>(|conn, journal| insert_in(conn, journal, model))
    }

    /// Updates inside the transaction.
    pub fn update<M: Model>(&self, model: &M) -> Result<()> {
        self.run::<M, _>(|conn, journal| update_in(conn, journal, model))
    }

    /// Deletes inside the transaction.
    pub fn delete<M: Model>(&self, model: &M) -> Result<()> {
        self.run::<M, _>(|conn, journal| delete_in(conn, journal, model))
    }

    /// Reads a row as this transaction sees it.
    pub fn get<M: Model>(&self, key: &[Value]) -> Result<M> {
        self.client.check::<M>()?;
        self.with_conn(|conn, _| Table::new(conn).get(key))
    }

    /// Lists rows as this transaction sees them.
    pub fn list<M: Model>(&self, options: &ListOptions) -> Result<Vec<M>> {
        self.client.check::<M>()?;
        self.with_conn(|conn, _| Table::new(conn).list(options))
    }

    /// Commits, then wakes every watch once.
    ///
    /// # Errors
    ///
    /// `Error::TxInvalid` when this transaction already finished.
    pub fn commit(&mut self) -> Result<()> {
        let inner = &self.client.inner;
        let result = {
            let mut state = inner.state.lock();
            if state.tx != Some(self.id) {
                return Err(Error::TxInvalid);
            }
            state.tx = None;
            let conn = state.writer.as_ref().ok_or_else(closed)?;
            match conn.execute_batch("COMMIT") {
                Ok(()) => {
                    inner.journal.committed();
                    Ok(())
                }
                Err(err) => {
                    rollback(conn);
                    inner.journal.unstage();
                    Err(err).with_context(|| format!("commit transaction {}", self.id))
                }
            }
        };
        self.permit = None;
        debug!(tx = self.id, ok = result.is_ok(), "transaction committed");
        result
    }

    /// Rolls back and discards staged journal entries. Nobody is notified.
    ///
    /// # Errors
    ///
    /// `Error::TxInvalid` when this transaction already finished.
    pub fn end(&mut self) -> Result<()> {
        let inner = &self.client.inner;
        {
            let mut state = inner.state.lock();
            if state.tx != Some(self.id) {
                return Err(Error::TxInvalid);
            }
            state.tx = None;
            if let Some(conn) = state.writer.as_ref() {
                rollback(conn);
            }
            inner.journal.unstage();
        }
        self.permit = None;
        debug!(tx = self.id, "transaction ended");
        Ok(())
    }

    fn run<M, F>(&self, op: F) -> Result<()>
    where
        M: Model,
        F: FnOnce(&Connection, &Journal) -> Result<()>,
    {
        self.client.check::<M>()?;
        self.with_conn(|conn, journal| {
            conn.execute_batch("SAVEPOINT ctrlkit_op")
                .with_context(|| format!("open savepoint in transaction {}", self.id))?;
            match op(conn, journal) {
                Ok(()) => conn
                    .execute_batch("RELEASE ctrlkit_op")
                    .with_context(|| format!("release savepoint in transaction {}", self.id)),
                Err(err) => {
                    if let Err(e) = conn.execute_batch("ROLLBACK TO ctrlkit_op; RELEASE ctrlkit_op") {
                        warn!(error = %e, "savepoint rollback failed");
                    }
                    Err(err)
                }
            }
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection, &Journal) -> Result<T>) -> Result<T> {
        let inner = &self.client.inner;
        let state = inner.state.lock();
        if state.tx != Some(self.id) {
            return Err(Error::TxInvalid);
        }
        let conn = state.writer.as_ref().ok_or_else(closed)?;
        f(conn, &inner.journal)
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.permit.is_some() {
            if let Err(err) = self.end() {
                debug!(tx = self.id, error = %err, "dropped transaction already finished");
            }
            self.permit = None;
        }
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.id)
            .field("open", &self.permit.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Label;

    fn label(name: &str, value: &str) -> Label {
        Label {
            kind: "Thing".into(),
            parent: "1".into(),
            name: name.into(),
            value: value.into(),
        }
    }

    fn open_client() -> (tempfile::TempDir, Client) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let client = Client::new(ClientConfig::new(dir.path().join("store.db")), Catalog::new());
        client.open(true).expect("should open");
        (dir, client)
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.page_limit, 100);
        assert_eq!(config.notify_capacity, 3);
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert_eq!(ClientConfig::new("x.db").with_page_limit(0).page_limit, 1);
    }

    #[test]
    fn test_closed_client_rejects_operations() {
        let client = Client::new(ClientConfig::new("/nonexistent/dir/x.db"), Catalog::new());
        assert!(matches!(client.insert(&label("a", "1")), Err(Error::Closed(_))));
        assert!(matches!(client.list::<Label>(&ListOptions::default()), Err(Error::Closed(_))));
        assert!(matches!(client.begin(), Err(Error::Closed(_))));
        client.close(false).expect("closing a closed client is a no-op");
    }

    #[test]
    fn test_open_failure_leaves_client_closed() {
        let client = Client::new(ClientConfig::new("/nonexistent/dir/x.db"), Catalog::new());
        let err = client.open(false).unwrap_err();
        assert!(matches!(err.root_cause(), Error::Store(_)));
        assert!(!client.is_open());
    }

    #[test]
    fn test_open_close_purge() {
        let (dir, client) = open_client();
        client.insert(&label("a", "1")).expect("should insert");
        client.close(true).expect("should close");
        client.close(true).expect("second close is a no-op");
        assert!(!dir.path().join("store.db").exists());

        client.open(false).expect("should reopen");
        assert_eq!(client.count::<Label>(None).expect("should count"), 0);
    }

    #[test]
    fn test_unregistered_model_rejected() {
        use crate::model::{Field, FieldType, Schema};
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Stray {
            id: i64,
        }
        static STRAY: Schema = Schema::new("Stray", &[Field::new("id", FieldType::Integer).pk()]);
        impl Model for Stray {
            fn schema() -> &'static Schema {
                &STRAY
            }
        }

        let (_dir, client) = open_client();
        let err = client.insert(&Stray { id: 1 }).unwrap_err();
        assert!(matches!(err, Error::Schema(ref m) if m.contains("Stray")));
    }

    #[test]
    fn test_encoding_mismatch_fails_first_write() {
        use crate::model::{Field, FieldType, Schema};
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Misfit {
            id: i64,
            size: String,
        }
        static MISFIT: Schema = Schema::new(
            "Misfit",
            &[
                Field::new("id", FieldType::Integer).pk(),
                Field::new("size", FieldType::Integer),
            ],
        );
        impl Model for Misfit {
            fn schema() -> &'static Schema {
                &MISFIT
            }
        }

        let dir = tempfile::tempdir().expect("should create temp dir");
        let catalog = Catalog::new().register::<Misfit>().expect("declaration is valid");
        let client = Client::new(ClientConfig::new(dir.path().join("store.db")), catalog);
        client.open(true).expect("should open");

        let misfit = Misfit { id: 1, size: "big".into() };
        let err = client.insert(&misfit).unwrap_err();
        assert!(matches!(err, Error::Schema(ref m) if m.contains("Misfit.size")));
        assert_eq!(client.count::<Misfit>(None).expect("should count"), 0);
        client.insert(&label("after", "1")).expect("store stays usable");
    }

    #[test]
    fn test_commit_wakes_each_watch_once() {
        use crate::model::{Event, EventHandler};

        struct Ignore;
        impl EventHandler<Label> for Ignore {
            fn created(&mut self, _: Event<Label>) {}
            fn updated(&mut self, _: Event<Label>) {}
            fn deleted(&mut self, _: Event<Label>) {}
        }

        let dir = tempfile::tempdir().expect("should create temp dir");
        let config = ClientConfig::new(dir.path().join("store.db")).with_notify_capacity(8);
        let client = Client::new(config, Catalog::new());
        client.open(true).expect("should open");
        // Registered but not started, so its wakes stay queued.
        let watch = client.journal().watch::<Label, _>(Ignore).expect("should watch");

        let mut tx = client.begin().expect("should begin");
        for name in ["a", "b", "c", "d"] {
            tx.insert(&label(name, "1")).expect("should insert");
        }
        tx.update(&label("a", "2")).expect("should update");
        assert_eq!(watch.take_wakes(), 0);
        assert_eq!(client.journal().event_id(), 0);

        tx.commit().expect("should commit");
        assert_eq!(watch.take_wakes(), 1);
        assert_eq!(client.journal().event_id(), 5);

        client.insert(&label("e", "1")).expect("should insert");
        assert_eq!(watch.take_wakes(), 1);
        assert_eq!(client.journal().event_id(), 6);
    }

    #[test]
    fn test_tx_commit_twice_is_invalid() {
        let (_dir, client) = open_client();
        let mut tx = client.begin().expect("should begin");
        tx.insert(&label("a", "1")).expect("should insert");
        tx.commit().expect("should commit");
        assert!(matches!(tx.commit(), Err(Error::TxInvalid)));
        assert!(matches!(tx.end(), Err(Error::TxInvalid)));
        assert!(matches!(tx.insert(&label("b", "1")), Err(Error::TxInvalid)));
        assert_eq!(client.count::<Label>(None).expect("should count"), 1);
    }

    #[test]
    fn test_tx_drop_rolls_back() {
        let (_dir, client) = open_client();
        {
            let tx = client.begin().expect("should begin");
            tx.insert(&label("a", "1")).expect("should insert");
        }
        assert_eq!(client.count::<Label>(None).expect("should count"), 0);
        // The gate was released by the drop.
        client.insert(&label("b", "1")).expect("should insert after drop");
    }

    #[test]
    fn test_failed_tx_op_leaves_no_partial_state() {
        let (_dir, client) = open_client();
        let mut tx = client.begin().expect("should begin");
        tx.insert(&label("a", "1")).expect("should insert");
        assert!(tx.insert(&label("a", "1")).is_err());
        assert!(tx.update(&label("missing", "1")).unwrap_err().is_not_found());
        tx.commit().expect("should commit");
        assert_eq!(client.count::<Label>(None).expect("should count"), 1);
    }

    #[test]
    fn test_purge_files_ignores_missing() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        purge_files(&dir.path().join("absent.db")).expect("missing files are fine");
    }
}
