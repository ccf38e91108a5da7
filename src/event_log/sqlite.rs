// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed event log.
//!
//! One row per event, ordered by an autoincrement `position`. Several
//! streams may share one database file; every query is scoped by
//! `stream_id`.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Appends retry with exponential backoff (max 5 attempts)
//! before the error is surfaced to the coordinator, which treats it as
//! fatal.
//!
//! # Durability
//!
//! WAL mode with `synchronous = FULL`: a committed append is on disk before
//! `append` returns.

use super::{BoxFuture, EventLog};
use crate::config::EventLogConfig;
use crate::error::{DeliveryError, Result};
use crate::types::{DeliveryConfirmation, DeliveryEvent, DeliverySeq, PendingCall};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// SQLITE_BUSY = 5, SQLITE_LOCKED = 6.
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Run a statement, retrying while SQLite reports busy/locked.
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite retry succeeded");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::log_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn seq_to_db(seq: DeliverySeq) -> Result<i64> {
    i64::try_from(seq.get())
        .map_err(|_| DeliveryError::Codec(format!("delivery_seq {seq} exceeds i64 range")))
}

fn seq_from_db(value: i64) -> Result<DeliverySeq> {
    u64::try_from(value)
        .map(DeliverySeq::new)
        .map_err(|_| DeliveryError::Codec(format!("negative delivery_seq {value}")))
}

type EventRow = (
    i64,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<Vec<u8>>,
);

fn decode_row(row: EventRow) -> Result<DeliveryEvent> {
    let (position, kind, seq, call_id, method_key, payload) = row;
    let delivery_seq = seq_from_db(seq)?;

    match kind.as_str() {
        DeliveryEvent::ACCEPTED => {
            let (Some(call_id), Some(method_key)) = (call_id, method_key) else {
                return Err(DeliveryError::Codec(format!(
                    "accepted event at position {position} is missing call fields"
                )));
            };
            Ok(DeliveryEvent::Accepted(PendingCall {
                call_id,
                method_key,
                payload: payload.unwrap_or_default(),
                delivery_seq,
            }))
        }
        DeliveryEvent::CONFIRMED => {
            Ok(DeliveryEvent::Confirmed(DeliveryConfirmation { delivery_seq }))
        }
        other => Err(DeliveryError::Codec(format!(
            "unknown event kind {other:?} at position {position}"
        ))),
    }
}

/// Durable event log stored in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
    stream_id: String,
    path: String,
}

impl SqliteEventLog {
    /// Open (or create) the log described by `config` for one stream.
    pub async fn open(config: &EventLogConfig, stream_id: impl Into<String>) -> Result<Self> {
        let stream_id = stream_id.into();
        if config.is_in_memory() {
            return Self::connect("sqlite::memory:", ":memory:", false, true, stream_id).await;
        }
        let url = format!("sqlite://{}?mode=rwc", config.sqlite_path);
        Self::connect(&url, &config.sqlite_path, config.wal_mode, false, stream_id).await
    }

    /// Open (or create) a WAL-mode log file at `path`.
    pub async fn open_path(path: impl AsRef<Path>, stream_id: impl Into<String>) -> Result<Self> {
        let config = EventLogConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            wal_mode: true,
        };
        Self::open(&config, stream_id).await
    }

    /// Open a private in-memory log. Events vanish with the value.
    pub async fn in_memory(stream_id: impl Into<String>) -> Result<Self> {
        Self::open(&EventLogConfig::in_memory(), stream_id).await
    }

    async fn connect(
        url: &str,
        path: &str,
        wal_mode: bool,
        in_memory: bool,
        stream_id: String,
    ) -> Result<Self> {
        info!(path = %path, stream_id = %stream_id, "Opening delivery event log");

        let journal_mode = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| DeliveryError::Config(format!("Invalid SQLite path: {e}")))?
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Full)
            .create_if_missing(true);

        // Single writer; an in-memory database also lives only as long as
        // its one connection, so that connection is never recycled.
        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_events (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                delivery_seq INTEGER NOT NULL,
                call_id TEXT,
                method_key TEXT,
                payload BLOB,
                recorded_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_events_stream \
             ON delivery_events (stream_id, position)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            stream_id,
            path: path.to_string(),
        })
    }

    /// Number of events stored for this stream.
    pub async fn len(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM delivery_events WHERE stream_id = ?")
                .bind(&self.stream_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn insert(&self, event: &DeliveryEvent) -> Result<()> {
        let seq = seq_to_db(event.delivery_seq())?;
        let (call_id, method_key, payload) = match event {
            DeliveryEvent::Accepted(call) => (
                Some(call.call_id.as_str()),
                Some(call.method_key.as_str()),
                Some(call.payload.as_slice()),
            ),
            DeliveryEvent::Confirmed(_) => (None, None, None),
        };
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let stream_id = self.stream_id.as_str();
        let kind = event.kind();

        execute_with_retry("append", || async move {
            sqlx::query(
                r#"
                INSERT INTO delivery_events
                    (stream_id, kind, delivery_seq, call_id, method_key, payload, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(stream_id)
            .bind(kind)
            .bind(seq)
            .bind(call_id)
            .bind(method_key)
            .bind(payload)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(())
    }

    async fn load(&self) -> Result<Vec<DeliveryEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT position, kind, delivery_seq, call_id, method_key, payload
            FROM delivery_events
            WHERE stream_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(&self.stream_id)
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .into_iter()
            .map(decode_row)
            .collect::<Result<Vec<_>>>()?;
        debug!(stream_id = %self.stream_id, events = events.len(), "Loaded event stream");
        Ok(events)
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the connection pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Delivery event log closed");
    }
}

impl EventLog for SqliteEventLog {
    fn append<'a>(&'a self, event: &'a DeliveryEvent) -> BoxFuture<'a, ()> {
        Box::pin(self.insert(event))
    }

    fn replay(&self) -> BoxFuture<'_, Vec<DeliveryEvent>> {
        Box::pin(self.load())
    }
}
