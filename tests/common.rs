#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ctrlkit::model::{Catalog, Field, FieldType, Labels, Schema};
use ctrlkit::remote::{Connector, Done, EventRef, Manager, Predicate, RestConfig};
use ctrlkit::{Client, ClientConfig, Event, EventHandler, Model};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub team: String,
    pub age: i64,
}

static PERSON: Schema = Schema::new(
    "Person",
    &[
        Field::new("id", FieldType::Integer).pk(),
        Field::new("name", FieldType::Text),
        Field::new("team", FieldType::Text),
        Field::new("age", FieldType::Integer),
    ],
);

impl Model for Person {
    fn schema() -> &'static Schema {
        &PERSON
    }

    fn labels(&self) -> Option<Labels> {
        Some(Labels::from([("team".to_string(), self.team.clone())]))
    }
}

pub fn person(id: i64, name: &str, team: &str) -> Person {
    Person {
        id,
        name: name.to_string(),
        team: team.to_string(),
        age: 20 + id,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub email: Option<String>,
    pub admin: bool,
}

static USER: Schema = Schema::new(
    "User",
    &[
        Field::new("name", FieldType::Text).pk(),
        Field::new("email", FieldType::Text).nullable(),
        Field::new("admin", FieldType::Bool),
    ],
);

impl Model for User {
    fn schema() -> &'static Schema {
        &USER
    }
}

pub fn user(name: &str, email: Option<&str>, admin: bool) -> User {
    User {
        name: name.to_string(),
        email: email.map(str::to_string),
        admin,
    }
}

pub fn catalog() -> Catalog {
    Catalog::new()
        .register::<Person>()
        .and_then(|c| c.register::<User>())
        .expect("register test models")
}

// =============================================================================
// Store
// =============================================================================

pub fn create_temp_db(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn open_client(name: &str) -> (tempfile::TempDir, Client) {
    let (dir, path) = create_temp_db(name);
    let client = Client::new(ClientConfig::new(path), catalog());
    client.open(true).expect("open client");
    (dir, client)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Blocking variant for tests that run on plain threads.
pub fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !f() {
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Recording Handler
// =============================================================================

/// Records every callback. Clones share the record.
pub struct Recorder<M> {
    events: Arc<Mutex<Vec<Event<M>>>>,
    errors: Arc<Mutex<Vec<String>>>,
    ended: Arc<AtomicBool>,
}

impl<M> Clone for Recorder<M> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            errors: Arc::clone(&self.errors),
            ended: Arc::clone(&self.ended),
        }
    }
}

impl<M> Default for Recorder<M> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<M: Clone> Recorder<M> {
    pub fn events(&self) -> Vec<Event<M>> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl<M: Send + 'static> EventHandler<M> for Recorder<M> {
    fn created(&mut self, event: Event<M>) {
        self.events.lock().push(event);
    }

    fn updated(&mut self, event: Event<M>) {
        self.events.lock().push(event);
    }

    fn deleted(&mut self, event: Event<M>) {
        self.events.lock().push(event);
    }

    fn error(&mut self, err: ctrlkit::Error) {
        self.errors.lock().push(err.to_string());
    }

    fn end(&mut self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Fake Cluster
// =============================================================================

struct Registration {
    kind: String,
    predicate: Arc<dyn Predicate>,
}

struct ManagerRecord {
    name: String,
    host: String,
    registrations: Vec<Registration>,
    done: Option<Done>,
}

impl ManagerRecord {
    fn is_running(&self) -> bool {
        self.done.as_ref().is_some_and(|d| !d.is_done())
    }
}

/// A cluster that records manager activity and replays events through the
/// registered predicates, the way a framework event loop would.
#[derive(Default)]
pub struct FakeCluster {
    managers: Mutex<Vec<ManagerRecord>>,
    refuse: AtomicBool,
    enqueued: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            cluster: Arc::clone(self),
        })
    }

    /// Makes every later connect fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.managers.lock().len()
    }

    pub fn running(&self) -> usize {
        self.managers.lock().iter().filter(|m| m.is_running()).count()
    }

    pub fn running_hosts(&self) -> Vec<String> {
        self.managers
            .lock()
            .iter()
            .filter(|m| m.is_running())
            .map(|m| m.host.clone())
            .collect()
    }

    /// Registrations of `kind` on running managers.
    pub fn registrations(&self, kind: &str) -> usize {
        self.managers
            .lock()
            .iter()
            .filter(|m| m.is_running())
            .flat_map(|m| m.registrations.iter())
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Delivers an event to every matching registration of every running
    /// manager. Returns how many predicates accepted it for the remote queue.
    pub fn emit(&self, event: EventRef<'_>) -> usize {
        let predicates: Vec<Arc<dyn Predicate>> = self
            .managers
            .lock()
            .iter()
            .filter(|m| m.is_running())
            .flat_map(|m| m.registrations.iter())
            .filter(|r| r.kind == event.object().kind)
            .map(|r| Arc::clone(&r.predicate))
            .collect();
        let accepted = predicates.iter().filter(|p| event.accepted_by(p.as_ref())).count();
        self.enqueued.fetch_add(accepted, Ordering::SeqCst);
        accepted
    }

    pub fn enqueued(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn manager_names(&self) -> Vec<String> {
        self.managers.lock().iter().map(|m| m.name.clone()).collect()
    }
}

struct FakeConnector {
    cluster: Arc<FakeCluster>,
}

impl Connector for FakeConnector {
    fn connect(&self, name: &str, config: &RestConfig) -> ctrlkit::Result<Box<dyn Manager>> {
        if self.cluster.refuse.load(Ordering::SeqCst) {
            return Err(ctrlkit::Error::Configuration(format!(
                "{name}: connection refused by {}",
                config.host
            )));
        }
        let mut managers = self.cluster.managers.lock();
        managers.push(ManagerRecord {
            name: name.to_string(),
            host: config.host.clone(),
            registrations: Vec::new(),
            done: None,
        });
        Ok(Box::new(FakeManager {
            cluster: Arc::clone(&self.cluster),
            index: managers.len() - 1,
        }))
    }
}

struct FakeManager {
    cluster: Arc<FakeCluster>,
    index: usize,
}

impl Manager for FakeManager {
    fn watch(&mut self, kind: &str, predicate: Arc<dyn Predicate>) -> ctrlkit::Result<()> {
        let mut managers = self.cluster.managers.lock();
        managers[self.index].registrations.push(Registration {
            kind: kind.to_string(),
            predicate,
        });
        Ok(())
    }

    fn start(&mut self, done: Done) -> ctrlkit::Result<()> {
        self.cluster.managers.lock()[self.index].done = Some(done);
        Ok(())
    }
}
