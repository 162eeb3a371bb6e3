//! Durable append log (SQLite)
//!
//! Appends never block the publisher: they are queued to a dedicated writer
//! thread which commits them in batches. The queue is bounded; when the
//! writer falls behind, further appends are discarded and counted in
//! [`AppendLog::append_failures`] while the events stay in the ring. Reads
//! run on the blocking pool.
//! [`AppendLog::flush`] is a barrier: it resolves once every command queued
//! before it has been committed, so a read issued after a flush observes all
//! earlier appends.
//!
//! # Schema
//!
//! - `events`: one row per [`StoredEvent`], keyed by `seq`
//! - `dropped_events`: one row per [`DroppedEventRecord`]
//!
//! Timestamps are stored as epoch milliseconds.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{DropReason, DroppedEventRecord, StoredEvent};
use crate::utils::time::{epoch_millis, from_epoch_millis};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY,
    topic TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL  -- epoch ms
);

CREATE INDEX IF NOT EXISTS idx_events_topic_seq ON events(topic, seq);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);

CREATE TABLE IF NOT EXISTS dropped_events (
    id INTEGER PRIMARY KEY,
    client_id TEXT NOT NULL,
    topic TEXT NOT NULL,
    reason TEXT NOT NULL,             -- buffer_full | client_gone | cursor_expired
    dropped_count INTEGER NOT NULL,
    first_dropped_seq INTEGER NOT NULL,
    last_dropped_seq INTEGER NOT NULL,
    created_at INTEGER NOT NULL       -- epoch ms
);

CREATE INDEX IF NOT EXISTS idx_dropped_client ON dropped_events(client_id);
CREATE INDEX IF NOT EXISTS idx_dropped_created ON dropped_events(created_at);
"#;

/// Commands drained by the writer thread per transaction
const WRITE_BATCH: usize = 256;

/// Default bound on commands waiting for the writer thread
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// Rows deleted per statement while pruning
const PRUNE_BATCH: i64 = 1000;

enum LogCommand {
    Append(Arc<StoredEvent>),
    RecordDropped(DroppedEventRecord),
    Flush(oneshot::Sender<()>),
}

/// Row counts removed by a prune pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub events_deleted: u64,
    pub dropped_deleted: u64,
}

/// Snapshot of the log's size and health
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub rows: i64,
    pub min_seq: Option<i64>,
    pub max_seq: Option<i64>,
    pub dropped_records: i64,
    pub append_failures: u64,
}

/// SQLite-backed append log
pub struct AppendLog {
    conn: Arc<Mutex<Connection>>,
    tx: mpsc::Sender<LogCommand>,
    failures: Arc<AtomicU64>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLog").field("path", &self.path).finish()
    }
}

impl AppendLog {
    /// Open (or create) the log file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_capacity(path, DEFAULT_QUEUE_CAPACITY)
    }

    /// Like [`AppendLog::open`] with at most `queue_capacity` pending writes
    pub fn open_with_capacity<P: AsRef<Path>>(
        path: P,
        queue_capacity: usize,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        info!(path = %path.display(), journal_mode = %mode, "event log opened");
        Self::start(conn, Some(path.to_path_buf()), queue_capacity)
    }

    /// Volatile log for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::start(Connection::open_in_memory()?, None, DEFAULT_QUEUE_CAPACITY)
    }

    fn start(
        conn: Connection,
        path: Option<PathBuf>,
        queue_capacity: usize,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;

        let conn = Arc::new(Mutex::new(conn));
        let failures = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));

        {
            let conn = conn.clone();
            let failures = failures.clone();
            thread::Builder::new()
                .name("event-log-writer".to_string())
                .spawn(move || run_writer(conn, rx, failures))?;
        }

        Ok(Self {
            conn,
            tx,
            failures,
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queue an event for persistence. Never blocks; a full queue discards
    /// the append and counts it as a failure.
    pub fn append(&self, event: Arc<StoredEvent>) {
        match self.tx.try_send(LogCommand::Append(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(LogCommand::Append(event))) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(seq = event.seq, topic = %event.topic, "event log queue full, append discarded");
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("event log writer stopped, append discarded");
            }
        }
    }

    /// Queue a drop record for persistence. Never blocks.
    pub fn record_dropped(&self, record: DroppedEventRecord) {
        match self.tx.try_send(LogCommand::RecordDropped(record)) {
            Ok(()) => {}
            Err(TrySendError::Full(LogCommand::RecordDropped(record))) => warn!(
                client_id = %record.client_id,
                dropped_count = record.dropped_count,
                "event log queue full, drop record discarded"
            ),
            Err(_) => warn!("event log writer stopped, drop record discarded"),
        }
    }

    /// Wait until everything queued so far is committed
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Flush(ack_tx))
            .await
            .map_err(|_| StoreError::LogUnavailable)?;
        ack_rx.await.map_err(|_| StoreError::LogUnavailable)
    }

    /// Number of appends that could not be persisted
    pub fn append_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn read<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
    }

    /// Highest persisted seq (blocking; used at startup)
    pub fn max_seq(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))?)
    }

    /// Newest `n` persisted events, oldest first (blocking; used at startup)
    pub fn tail(&self, n: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, topic, event_type, data, created_at FROM events
             ORDER BY seq DESC LIMIT ?1",
        )?;
        let mut events = stmt
            .query_map(params![n as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    /// Lowest persisted seq
    pub async fn min_seq(&self) -> Result<Option<i64>, StoreError> {
        self.read(|conn| conn.query_row("SELECT MIN(seq) FROM events", [], |row| row.get(0)))
            .await
    }

    /// Up to `limit` events with `seq > since`, ascending
    pub async fn range(&self, since: i64, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT seq, topic, event_type, data, created_at FROM events
                 WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![since, limit as i64], row_to_event)?;
            rows.collect()
        })
        .await
    }

    /// Look up a single event
    pub async fn get(&self, seq: i64) -> Result<Option<StoredEvent>, StoreError> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT seq, topic, event_type, data, created_at FROM events WHERE seq = ?1",
                params![seq],
                row_to_event,
            )
            .optional()
        })
        .await
    }

    /// Drop records, newest first, optionally for one client
    pub async fn dropped_events(
        &self,
        client_id: Option<String>,
        limit: usize,
    ) -> Result<Vec<DroppedEventRecord>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, client_id, topic, reason, dropped_count,
                        first_dropped_seq, last_dropped_seq, created_at
                 FROM dropped_events
                 WHERE (?1 IS NULL OR client_id = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![client_id, limit as i64], row_to_dropped)?;
            rows.collect()
        })
        .await
    }

    /// Delete events older than `event_cutoff` and drop records older than
    /// `dropped_cutoff` (both epoch ms), in bounded batches
    pub async fn prune(
        &self,
        event_cutoff_ms: i64,
        dropped_cutoff_ms: i64,
    ) -> Result<PruneReport, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<PruneReport> {
            let mut report = PruneReport::default();
            loop {
                // Re-acquire per batch so the writer thread can interleave
                let deleted = conn.lock().execute(
                    "DELETE FROM events WHERE seq IN (
                         SELECT seq FROM events WHERE created_at < ?1
                         ORDER BY seq LIMIT ?2)",
                    params![event_cutoff_ms, PRUNE_BATCH],
                )?;
                report.events_deleted += deleted as u64;
                if (deleted as i64) < PRUNE_BATCH {
                    break;
                }
            }
            loop {
                let deleted = conn.lock().execute(
                    "DELETE FROM dropped_events WHERE id IN (
                         SELECT id FROM dropped_events WHERE created_at < ?1
                         ORDER BY id LIMIT ?2)",
                    params![dropped_cutoff_ms, PRUNE_BATCH],
                )?;
                report.dropped_deleted += deleted as u64;
                if (deleted as i64) < PRUNE_BATCH {
                    break;
                }
            }
            Ok(report)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
    }

    pub async fn stats(&self) -> Result<LogStats, StoreError> {
        let failures = self.append_failures();
        self.read(move |conn| {
            let (rows, min_seq, max_seq): (i64, Option<i64>, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), MIN(seq), MAX(seq) FROM events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let dropped_records: i64 =
                conn.query_row("SELECT COUNT(*) FROM dropped_events", [], |row| row.get(0))?;
            Ok(LogStats {
                rows,
                min_seq,
                max_seq,
                dropped_records,
                append_failures: failures,
            })
        })
        .await
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        seq: row.get(0)?,
        topic: row.get(1)?,
        event_type: row.get(2)?,
        data: row.get(3)?,
        created_at: from_epoch_millis(row.get(4)?),
    })
}

fn row_to_dropped(row: &Row<'_>) -> rusqlite::Result<DroppedEventRecord> {
    let reason: String = row.get(3)?;
    let reason = reason.parse::<DropReason>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(DroppedEventRecord {
        id: Some(row.get(0)?),
        client_id: row.get(1)?,
        topic: row.get(2)?,
        reason,
        dropped_count: row.get(4)?,
        first_dropped_seq: row.get(5)?,
        last_dropped_seq: row.get(6)?,
        created_at: from_epoch_millis(row.get(7)?),
    })
}

fn run_writer(
    conn: Arc<Mutex<Connection>>,
    mut rx: mpsc::Receiver<LogCommand>,
    failures: Arc<AtomicU64>,
) {
    while let Some(first) = rx.blocking_recv() {
        let mut batch = Vec::with_capacity(WRITE_BATCH);
        batch.push(first);
        while batch.len() < WRITE_BATCH {
            match rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }

        let acks = {
            let mut conn = conn.lock();
            write_batch(&mut conn, batch, &failures)
        };
        for ack in acks {
            let _ = ack.send(());
        }
    }
    debug!("event log writer stopped");
}

/// Commit one batch; returns the flush acks to release afterwards
fn write_batch(
    conn: &mut Connection,
    batch: Vec<LogCommand>,
    failures: &AtomicU64,
) -> Vec<oneshot::Sender<()>> {
    let mut acks = Vec::new();
    let appends = batch
        .iter()
        .filter(|c| matches!(c, LogCommand::Append(_)))
        .count() as u64;

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            failures.fetch_add(appends, Ordering::Relaxed);
            warn!(error = %e, appends, "event log transaction failed to start");
            for cmd in batch {
                if let LogCommand::Flush(ack) = cmd {
                    acks.push(ack);
                }
            }
            return acks;
        }
    };

    for cmd in batch {
        match cmd {
            LogCommand::Append(event) => {
                if let Err(e) = tx.execute(
                    "INSERT INTO events (seq, topic, event_type, data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.seq,
                        event.topic,
                        event.event_type,
                        event.data,
                        epoch_millis(&event.created_at)
                    ],
                ) {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(seq = event.seq, topic = %event.topic, error = %e, "event log append failed");
                }
            }
            LogCommand::RecordDropped(rec) => {
                if let Err(e) = tx.execute(
                    "INSERT INTO dropped_events
                         (client_id, topic, reason, dropped_count,
                          first_dropped_seq, last_dropped_seq, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        rec.client_id,
                        rec.topic,
                        rec.reason.as_str(),
                        rec.dropped_count,
                        rec.first_dropped_seq,
                        rec.last_dropped_seq,
                        epoch_millis(&rec.created_at)
                    ],
                ) {
                    warn!(client_id = %rec.client_id, error = %e, "failed to persist drop record");
                }
            }
            LogCommand::Flush(ack) => acks.push(ack),
        }
    }

    if let Err(e) = tx.commit() {
        failures.fetch_add(appends, Ordering::Relaxed);
        warn!(error = %e, appends, "event log commit failed");
    }
    acks
}
