//! ctrlkit Journal Stress Binary
//!
//! Hammers one store from many writer threads while a watch follows the
//! journal, then checks that the watch saw every committed mutation exactly
//! in journal order.
//!
//! Run with: `cargo run --bin journal_stress -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: 1000 items, 8 writers, every 10th write in a transaction
//! cargo run --release --bin journal_stress
//!
//! # Heavier contention, tracing enabled
//! RUST_LOG=ctrlkit=debug cargo run --release --bin journal_stress -- --items 20000 --writers 32
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ctrlkit::model::{Catalog, Field, FieldType, ListOptions, Predicate, Schema};
use ctrlkit::{Client, ClientConfig, Event, EventHandler, Model, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Stress run configuration
struct Config {
    /// Items each writer inserts
    items: usize,
    /// Concurrent writer threads
    writers: usize,
    /// Every n-th insert is followed by an update and a delete in one transaction
    tx_every: usize,
    /// Store path (temp dir if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            items: 1000,
            writers: 8,
            tx_every: 10,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize| -> usize {
            match args.get(i).and_then(|v| v.parse().ok()) {
                Some(v) => v,
                None => {
                    eprintln!("Invalid value for {}", args[i - 1]);
                    std::process::exit(1);
                }
            }
        };
        match args[i].as_str() {
            "--items" | "-i" => {
                i += 1;
                config.items = value(i);
            }
            "--writers" | "-w" => {
                i += 1;
                config.writers = value(i).max(1);
            }
            "--tx-every" | "-t" => {
                i += 1;
                config.tx_every = value(i).max(1);
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = args.get(i).cloned();
            }
            "--help" | "-h" => {
                println!(
                    r#"ctrlkit Journal Stress

Usage: journal_stress [OPTIONS]

Options:
  -i, --items <N>     Items inserted per writer (default: 1000)
  -w, --writers <N>   Concurrent writer threads (default: 8)
  -t, --tx-every <N>  Transaction cadence (default: 10)
  -d, --db <PATH>     Store path (default: temp dir)
  -h, --help          Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: i64,
    writer: i64,
    rev: i64,
}

static ITEM: Schema = Schema::new(
    "Item",
    &[
        Field::new("id", FieldType::Integer).pk(),
        Field::new("writer", FieldType::Integer),
        Field::new("rev", FieldType::Integer),
    ],
);

impl Model for Item {
    fn schema() -> &'static Schema {
        &ITEM
    }
}

/// Counts deliveries and checks journal order.
#[derive(Clone, Default)]
struct Tally {
    created: Arc<AtomicU64>,
    updated: Arc<AtomicU64>,
    deleted: Arc<AtomicU64>,
    last_id: Arc<AtomicI64>,
    out_of_order: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    ended: Arc<AtomicBool>,
}

impl Tally {
    fn see(&self, event: &Event<Item>) {
        if event.id == 0 {
            return;
        }
        let previous = self.last_id.swap(event.id, Ordering::SeqCst);
        if event.id <= previous {
            self.out_of_order.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn total(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
            + self.updated.load(Ordering::Relaxed)
            + self.deleted.load(Ordering::Relaxed)
    }
}

impl EventHandler<Item> for Tally {
    fn created(&mut self, event: Event<Item>) {
        self.see(&event);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn updated(&mut self, event: Event<Item>) {
        self.see(&event);
        self.updated.fetch_add(1, Ordering::Relaxed);
    }

    fn deleted(&mut self, event: Event<Item>) {
        self.see(&event);
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn error(&mut self, err: ctrlkit::Error) {
        eprintln!("delivery error: {err}");
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn end(&mut self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = parse_args();

    println!("ctrlkit Journal Stress");
    println!("======================");
    println!("Items/writer: {}", config.items);
    println!("Writers:      {}", config.writers);
    println!("Tx every:     {}", config.tx_every);
    println!();

    let temp_dir = tempfile::tempdir()?;
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.path().join("stress.db").to_string_lossy().to_string());
    println!("Database:     {}", db_path);
    println!();

    let client = Client::new(ClientConfig::new(&db_path), Catalog::new().register::<Item>()?);
    client.open(true)?;

    let tally = Tally::default();
    let watch = client.watch::<Item, _>(tally.clone())?;

    let written = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    println!("Starting stress run...");
    let start = Instant::now();

    let mut handles = Vec::new();
    for writer in 0..config.writers {
        let client = client.clone();
        let written = Arc::clone(&written);
        let failures = Arc::clone(&failures);
        let items = config.items;
        let tx_every = config.tx_every;

        handles.push(thread::spawn(move || {
            for n in 0..items {
                let item = Item {
                    id: (writer * items + n) as i64,
                    writer: writer as i64,
                    rev: 0,
                };
                let result = if n % tx_every == 0 {
                    // insert + update + delete, one commit
                    client.begin().and_then(|mut tx| {
                        tx.insert(&item)?;
                        tx.update(&Item { rev: 1, ..item.clone() })?;
                        tx.delete(&item)?;
                        tx.commit()?;
                        Ok(3)
                    })
                } else {
                    client.insert(&item).map(|()| 1)
                };
                match result {
                    Ok(events) => {
                        written.fetch_add(events, Ordering::Relaxed);
                    }
                    Err(err) => {
                        eprintln!("write failed: {err}");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for handle in handles {
        if handle.join().is_err() {
            failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    let write_elapsed = start.elapsed();
    let written = written.load(Ordering::Relaxed);

    // Deliveries are asynchronous; wait for the watch to catch up.
    let deadline = Instant::now() + Duration::from_secs(30);
    while tally.total() < written && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let delivery_elapsed = start.elapsed();

    watch.end();
    watch.join()?;

    println!();
    println!("Results");
    println!("-------");
    println!("Events written:   {}", written);
    println!("Write failures:   {}", failures.load(Ordering::Relaxed));
    println!("Created seen:     {}", tally.created.load(Ordering::Relaxed));
    println!("Updated seen:     {}", tally.updated.load(Ordering::Relaxed));
    println!("Deleted seen:     {}", tally.deleted.load(Ordering::Relaxed));
    println!("Write time:       {:?}", write_elapsed);
    println!("Delivery time:    {:?}", delivery_elapsed);
    println!(
        "Throughput:       {:.2} events/sec",
        written as f64 / write_elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");
    let mut failed = false;
    let mut check = |ok: bool, what: &str| {
        println!("  {:<40} {}", what, if ok { "ok" } else { "FAILED" });
        failed |= !ok;
    };

    check(tally.total() == written, "every committed event delivered");
    check(tally.out_of_order.load(Ordering::Relaxed) == 0, "delivery in journal order");
    check(tally.errors.load(Ordering::Relaxed) == 0, "no delivery errors");
    check(tally.ended.load(Ordering::SeqCst), "handler ended");
    check(
        client.journal().event_id() as u64 == written,
        "journal ids gapless",
    );

    let per_writer = (config.items - config.items.div_ceil(config.tx_every)) as i64;
    let mut rows_ok = true;
    for writer in 0..config.writers as i64 {
        let rows = client.count::<Item>(Some(&Predicate::eq("writer", writer)))?;
        rows_ok &= rows == per_writer;
    }
    check(rows_ok, "surviving rows per writer");
    let sorted = client.list::<Item>(&ListOptions::default().sort_by("-id"))?;
    check(
        sorted.windows(2).all(|w| w[0].id > w[1].id),
        "descending sort",
    );

    client.close(true)?;

    println!();
    if failed {
        println!("Stress run FAILED");
        std::process::exit(1);
    }
    println!("Stress run PASSED");
    Ok(())
}
