//! The database engine: all tables under one reader/writer lock, plus
//! the asynchronous write pipeline.
//!
//! # Concurrency model
//!
//! A single `parking_lot::RwLock` guards the table map. Queries take the
//! shared side; the write worker and synchronous deletes take the
//! exclusive side. One dedicated worker thread consumes the write queue:
//! it drains up to `batch_size` tasks per iteration (waking at least
//! every `idle_wait` regardless), applies them under one exclusive lock
//! acquisition — so a batch becomes visible atomically — and then
//! snapshots every table under the shared lock.
//!
//! Inserts and updates return as soon as the task is enqueued; nothing
//! is reported back to the caller once a task is accepted. Deletes are
//! synchronous. `shutdown` closes the queue, lets the worker drain what
//! remains, and joins it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{DbError, Result};

use super::model::TableStatsBody;
use super::recovery::{self, valid_table_name};
use super::snapshot;
use super::table::Table;

/// Engine configuration. Every knob has the documented default; the CLI
/// overrides them per flag.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `<table>.json` and `<table>.index` files.
    pub data_dir: PathBuf,
    /// Most write tasks applied per batch.
    pub batch_size: usize,
    /// Worker wake interval while the queue is empty.
    pub idle_wait: Duration,
    /// Pre-sizing hint for a table's first ANN index.
    pub ann_capacity_hint: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            batch_size: 100,
            idle_wait: Duration::from_secs(5),
            ann_capacity_hint: 20_000,
        }
    }
}

struct WriteTask {
    table: String,
    id: String,
    fields: HashMap<String, String>,
    embedding: Vec<f32>,
}

enum QueueMsg {
    Write(WriteTask),
    /// Quiesce marker: acked once everything queued before it has been
    /// applied and snapshotted.
    Drain(Sender<()>),
}

struct Shared {
    config: Config,
    tables: RwLock<HashMap<String, Table>>,
}

/// Process-wide engine handle. Create one at startup, share it behind an
/// `Arc`, and call [`Database::shutdown`] (or drop it) to stop the
/// worker.
pub struct Database {
    shared: Arc<Shared>,
    queue: Mutex<Option<Sender<QueueMsg>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Open the engine: recover tables from `config.data_dir` and start
    /// the write worker.
    pub fn open(config: Config) -> Result<Self> {
        let tables = recovery::load_tables(&config.data_dir)?;
        tracing::info!(
            data_dir = %config.data_dir.display(),
            tables = tables.len(),
            "database open"
        );

        let shared = Arc::new(Shared {
            config,
            tables: RwLock::new(tables),
        });

        let (tx, rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("middb-writer".into())
            .spawn(move || run_worker(worker_shared, rx))?;

        Ok(Self {
            shared,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue an upsert. Returns once the task is queued; it becomes
    /// visible when the worker applies its batch.
    pub fn insert(
        &self,
        table: &str,
        id: &str,
        fields: HashMap<String, String>,
        embedding: Vec<f32>,
    ) -> Result<()> {
        if !valid_table_name(table) {
            return Err(DbError::BadRequest(format!(
                "invalid table name '{table}': expected [A-Za-z0-9_]+"
            )));
        }
        if id.is_empty() {
            return Err(DbError::BadRequest("record id must not be empty".into()));
        }
        if embedding.is_empty() {
            return Err(DbError::BadRequest("embedding must not be empty".into()));
        }

        let task = WriteTask {
            table: table.to_string(),
            id: id.to_string(),
            fields,
            embedding,
        };
        let queue = self.queue.lock();
        let tx = queue.as_ref().ok_or(DbError::Shutdown)?;
        tx.send(QueueMsg::Write(task)).map_err(|_| DbError::Shutdown)
    }

    /// Same as [`Database::insert`]; an existing id is overwritten in
    /// place and keeps its label.
    pub fn update(
        &self,
        table: &str,
        id: &str,
        fields: HashMap<String, String>,
        embedding: Vec<f32>,
    ) -> Result<()> {
        self.insert(table, id, fields, embedding)
    }

    /// Synchronously remove a record. Missing table or id is a no-op.
    pub fn delete(&self, table: &str, id: &str) -> Result<()> {
        if !valid_table_name(table) {
            return Err(DbError::BadRequest(format!(
                "invalid table name '{table}': expected [A-Za-z0-9_]+"
            )));
        }
        let mut tables = self.shared.tables.write();
        if let Some(t) = tables.get_mut(table) {
            if t.delete(id) {
                tracing::info!(table, id, "deleted record");
            }
        }
        Ok(())
    }

    /// Exact field equality. Missing table, field, or value yields an
    /// empty list; ids come back sorted.
    pub fn query_field(&self, table: &str, field: &str, value: &str) -> Vec<String> {
        let tables = self.shared.tables.read();
        tables
            .get(table)
            .map(|t| t.query_field(field, value))
            .unwrap_or_default()
    }

    /// k-NN over a table's embeddings, nearest first. A missing table or
    /// an unpopulated index yields an empty list; a query vector whose
    /// length differs from the table's dimensionality is an error.
    pub fn query_embedding(&self, table: &str, query: &[f32], top_k: usize) -> Result<Vec<String>> {
        let tables = self.shared.tables.read();
        match tables.get(table) {
            Some(t) => t.query_embedding(query, top_k),
            None => Ok(Vec::new()),
        }
    }

    /// Field filter intersected with ANN candidates.
    ///
    /// The ANN side over-fetches `top_k × 10` candidates: field
    /// selectivity is unknown and the graph is approximate, so the
    /// wider candidate list absorbs the intersection loss without a
    /// second scan. Candidate order (distance ascending) is preserved.
    ///
    /// The two sub-queries each take the shared lock on their own; a
    /// write landing between them may shift the intersection, which is
    /// accepted.
    pub fn query_hybrid(
        &self,
        table: &str,
        field: &str,
        value: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<String>> {
        let matched: HashSet<String> = self.query_field(table, field, value).into_iter().collect();
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = self.query_embedding(table, query, top_k.saturating_mul(10))?;
        Ok(candidates
            .into_iter()
            .filter(|id| matched.contains(id))
            .take(top_k)
            .collect())
    }

    pub fn table_count(&self) -> usize {
        self.shared.tables.read().len()
    }

    /// Per-table stats, or `None` for an unknown table.
    pub fn table_stats(&self, table: &str) -> Option<TableStatsBody> {
        let tables = self.shared.tables.read();
        tables.get(table).map(|t| TableStatsBody {
            records: t.len(),
            dim: t.dim(),
            next_label: t.next_label(),
        })
    }

    /// Block until every task queued before this call has been applied
    /// and snapshotted. Test and operations hook.
    pub fn drain(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        {
            let queue = self.queue.lock();
            let tx = queue.as_ref().ok_or(DbError::Shutdown)?;
            tx.send(QueueMsg::Drain(ack_tx))
                .map_err(|_| DbError::Shutdown)?;
        }
        ack_rx.recv().map_err(|_| DbError::Shutdown)
    }

    /// Snapshot every table right now, bypassing the worker cadence.
    pub fn flush_now(&self) {
        snapshot_all(&self.shared);
    }

    /// Close the queue, let the worker drain and apply what remains,
    /// and join it. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let tx = self.queue.lock().take();
        drop(tx);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("write worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>, rx: Receiver<QueueMsg>) {
    tracing::debug!("write worker started");
    loop {
        let first = match rx.recv_timeout(shared.config.idle_wait) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut batch: Vec<WriteTask> = Vec::new();
        let mut acks: Vec<Sender<()>> = Vec::new();
        collect(first, &mut batch, &mut acks);

        // Drain follows the queue order, so by the time a Drain marker
        // is seen every task ahead of it is already in this batch or a
        // previous one. Stop collecting at the marker so the ack only
        // covers what actually preceded it.
        while acks.is_empty() && batch.len() < shared.config.batch_size {
            match rx.try_recv() {
                Ok(msg) => collect(msg, &mut batch, &mut acks),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if !batch.is_empty() {
            apply_batch(&shared, batch);
            snapshot_all(&shared);
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }

    // Channel closed: everything queued was already received above, so
    // one final snapshot finishes the drain.
    snapshot_all(&shared);
    tracing::info!("write worker stopped");
}

fn collect(msg: QueueMsg, batch: &mut Vec<WriteTask>, acks: &mut Vec<Sender<()>>) {
    match msg {
        QueueMsg::Write(task) => batch.push(task),
        QueueMsg::Drain(ack) => acks.push(ack),
    }
}

fn apply_batch(shared: &Shared, batch: Vec<WriteTask>) {
    let applied = batch.len();
    let mut tables = shared.tables.write();
    for task in batch {
        let WriteTask {
            table: table_name,
            id,
            fields,
            embedding,
        } = task;
        let table = tables.entry(table_name.clone()).or_insert_with(|| {
            tracing::info!(table = %table_name, dim = embedding.len(), "creating table");
            Table::new(embedding.len())
        });
        match table.upsert(&id, fields, embedding, shared.config.ann_capacity_hint) {
            Ok(()) => tracing::info!(table = %table_name, id = %id, "applied upsert"),
            Err(e) => {
                // Accepted-at-enqueue contract: nothing to send back, so
                // the task is logged and dropped.
                tracing::warn!(table = %table_name, id = %id, error = %e, "dropping write task")
            }
        }
    }
    drop(tables);
    tracing::debug!(batch = applied, "write batch applied");
}

fn snapshot_all(shared: &Shared) {
    let tables = shared.tables.read();
    for (name, table) in tables.iter() {
        if let Err(e) = snapshot::write_table(&shared.config.data_dir, name, table) {
            // Data stays in memory and the next batch retries the flush.
            tracing::error!(table = %name, error = %e, "snapshot write failed");
        }
    }
}
