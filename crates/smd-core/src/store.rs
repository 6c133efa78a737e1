//! Capture Store — the embedded relational store backing persisted lines.
//!
//! One `captured` table, a write-batching buffer, a background retention
//! task, and corruption recovery. Built on `tokio-rusqlite` the same way
//! the teacher's `CacheDb` wraps `rusqlite`: a single background-thread
//! connection, driven through `.call(|conn| ...)` closures so the blocking
//! SQLite API never runs on an async worker thread.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Row;
use serde_json::{Map, Value as JsonValue};
use smd_harness::ShutdownSignal;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;
use tracing::{error, info, warn};

use crate::types::CapturedLine;

const FLUSH_BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
const FLUSH_TICK: Duration = Duration::from_millis(200);

const FORBIDDEN_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("query must be a pure SELECT statement and must not contain mutating keywords")]
    NotReadOnly,
}

pub struct CaptureStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    buffer: Mutex<Vec<CapturedLine>>,
    last_flush: Mutex<Instant>,
    max_records: u64,
    session_id: String,
    retention_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    flush_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CaptureStore {
    /// Open (or create) the store at `path`, running integrity checks and
    /// self-healing on corruption, then start the retention and periodic
    /// flush background tasks.
    pub async fn open(
        path: impl AsRef<Path>,
        max_records: u64,
        cleanup_interval: Duration,
        session_id: impl Into<String>,
        shutdown: ShutdownSignal,
    ) -> Result<std::sync::Arc<Self>, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path).await?;
        init_schema(&conn).await?;

        let store = std::sync::Arc::new(Self {
            conn: Mutex::new(conn),
            path,
            buffer: Mutex::new(Vec::with_capacity(FLUSH_BATCH_SIZE)),
            last_flush: Mutex::new(Instant::now()),
            max_records,
            session_id: session_id.into(),
            retention_handle: Mutex::new(None),
            flush_handle: Mutex::new(None),
        });

        if !store.check_integrity().await.unwrap_or(false) {
            warn!("capture store failed integrity check at open, recovering");
            store.recover_from_corruption().await?;
        }

        let retention = {
            let store = store.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("retention task observed shutdown, exiting");
                            break;
                        }
                        _ = tokio::time::sleep(cleanup_interval) => {
                            if let Err(e) = store.run_retention().await {
                                error!(error = %e, "retention pass failed");
                            }
                        }
                    }
                }
            })
        };
        *store.retention_handle.lock().await = Some(retention);

        let flusher = {
            let store = store.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(FLUSH_TICK) => {
                            let should_flush = {
                                let buf = store.buffer.lock().await;
                                let last = store.last_flush.lock().await;
                                !buf.is_empty() && last.elapsed() >= FLUSH_INTERVAL
                            };
                            if should_flush {
                                if let Err(e) = store.flush().await {
                                    error!(error = %e, "timed flush failed");
                                }
                            }
                        }
                    }
                }
            })
        };
        *store.flush_handle.lock().await = Some(flusher);

        Ok(store)
    }

    /// Buffer a line for batched insertion. Non-blocking: returns once the
    /// row is in the in-memory buffer, not once it is durable.
    pub async fn append(&self, line: CapturedLine) -> Result<(), StoreError> {
        let should_flush = {
            let mut buf = self.buffer.lock().await;
            buf.push(line);
            buf.len() >= FLUSH_BATCH_SIZE
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Insert a single row immediately, bypassing the buffer. Used for
    /// lifecycle markers, which must be durable before any later buffered
    /// row is flushed.
    pub async fn append_now(&self, line: CapturedLine) -> Result<(), StoreError> {
        let result = {
            let conn = self.conn.lock().await;
            conn.call(move |conn| {
                conn.execute(
                    "INSERT INTO captured (timestamp, port, session_id, data) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![line.timestamp, line.port, line.session_id, line.data],
                )?;
                Ok(())
            })
            .await
        };
        if let Err(e) = &result {
            if is_corruption(e) {
                self.recover_from_corruption().await?;
                return Ok(());
            }
        }
        *self.last_flush.lock().await = Instant::now();
        result.map_err(StoreError::from)
    }

    /// Force any buffered rows to the underlying file, in a single
    /// transaction. A failed batch rolls back entirely.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let pending = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                Vec::new()
            } else {
                std::mem::take(&mut *buf)
            }
        };
        *self.last_flush.lock().await = Instant::now();
        if pending.is_empty() {
            return Ok(());
        }

        let result = {
            let conn = self.conn.lock().await;
            conn.call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO captured (timestamp, port, session_id, data) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for line in &pending {
                        stmt.execute(rusqlite::params![
                            line.timestamp,
                            line.port,
                            line.session_id,
                            line.data
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
        };

        if let Err(e) = &result {
            if is_corruption(e) {
                warn!("corruption detected during flush, recovering (buffered rows discarded)");
                self.recover_from_corruption().await?;
                return Ok(());
            }
        }
        result.map_err(StoreError::from)
    }

    /// Read-only ad-hoc query. Rejects anything that is not a pure
    /// `SELECT`, including statements that merely *mention* a mutating
    /// keyword, before the statement ever reaches SQLite.
    pub async fn query(
        &self,
        sql: &str,
        params: Vec<JsonValue>,
    ) -> Result<Vec<Map<String, JsonValue>>, StoreError> {
        validate_read_only(sql)?;
        let sql = sql.to_string();
        let conn = self.conn.lock().await;
        conn.call(move |conn| {
            let sql_params: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
            let mut stmt = conn.prepare(&sql)?;
            let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt.query_map(rusqlite::params_from_iter(sql_params), |row| {
                row_to_json(row, &col_names)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(StoreError::from)
    }

    /// Rows captured within the last `seconds`, newest last.
    pub async fn recent(
        &self,
        seconds: i64,
        port: Option<String>,
        session: Option<String>,
        limit: i64,
    ) -> Result<Vec<CapturedLine>, StoreError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(seconds))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let conn = self.conn.lock().await;
        let mut rows = conn
            .call(move |conn| {
                // Newest rows first so `LIMIT` keeps the most recent `limit`
                // rows of the window, not its oldest; reversed below to
                // restore chronological ("newest last") order.
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, port, session_id, data FROM captured \
                     WHERE timestamp >= ?1 \
                       AND (?2 IS NULL OR port = ?2) \
                       AND (?3 IS NULL OR session_id = ?3) \
                     ORDER BY id DESC LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![cutoff, port, session, limit],
                    row_to_captured_line,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)?;
        rows.reverse();
        Ok(rows)
    }

    /// The most recent `n` rows, in chronological order.
    pub async fn tail(
        &self,
        n: i64,
        port: Option<String>,
        session: Option<String>,
    ) -> Result<Vec<CapturedLine>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, port, session_id, data FROM captured \
                     WHERE (?1 IS NULL OR port = ?1) \
                       AND (?2 IS NULL OR session_id = ?2) \
                     ORDER BY id DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![port, session, n],
                    row_to_captured_line,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn count(&self, session: Option<String>) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM captured WHERE (?1 IS NULL OR session_id = ?1)",
                rusqlite::params![session],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
        .await
        .map_err(StoreError::from)
    }

    pub async fn check_integrity(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let result: String = conn
            .call(|conn| {
                conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await?;
        Ok(result.eq_ignore_ascii_case("ok"))
    }

    /// Flush pending writes and stop the background tasks. Idempotent.
    pub async fn close(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "flush during close failed");
        }
        for handle in [
            self.retention_handle.lock().await.take(),
            self.flush_handle.lock().await.take(),
        ] {
            if let Some(handle) = handle {
                match tokio::time::timeout(Duration::from_secs(2), handle).await {
                    Ok(_) => {}
                    Err(_) => warn!("background store task did not exit within 2s, abandoning"),
                }
            }
        }
    }

    async fn run_retention(&self) -> Result<(), StoreError> {
        let max_records = self.max_records;
        let deleted = {
            let conn = self.conn.lock().await;
            conn.call(move |conn| {
                let total: i64 = conn.query_row("SELECT COUNT(*) FROM captured", [], |r| r.get(0))?;
                if (total as u64) <= max_records {
                    return Ok(0i64);
                }
                let excess = total as u64 - max_records;
                let tx = conn.transaction()?;
                let deleted = tx.execute(
                    "DELETE FROM captured WHERE id IN (SELECT id FROM captured ORDER BY id ASC LIMIT ?1)",
                    rusqlite::params![excess],
                )?;
                tx.commit()?;
                // Slow, but matches the original's explicit reclaim-on-cleanup
                // behaviour; retention and VACUUM share the same write path
                // so it can never interleave with a batched insert.
                conn.execute_batch("VACUUM")?;
                Ok(deleted as i64)
            })
            .await?
        };
        if deleted > 0 {
            info!(deleted, max_records, "retention pass removed oldest rows");
        }
        Ok(())
    }

    async fn recover_from_corruption(&self) -> Result<(), StoreError> {
        let suffix = unix_now();
        let corrupt_path = self.path.with_extension(format!("corrupt.{suffix}.db"));

        let mut guard = self.conn.lock().await;
        let placeholder = Connection::open_in_memory().await?;
        let old = std::mem::replace(&mut *guard, placeholder);
        let _ = old.close().await;

        if self.path.exists() {
            std::fs::rename(&self.path, &corrupt_path)?;
            warn!(corrupt_path = %corrupt_path.display(), "quarantined corrupted capture store");
        }

        let fresh = Connection::open(&self.path).await?;
        init_schema(&fresh).await?;
        *guard = fresh;
        drop(guard);

        {
            let mut buf = self.buffer.lock().await;
            buf.clear();
        }

        self.append_now(CapturedLine::marker(
            self.session_id.clone(),
            "DATABASE_RECOVERED_FROM_CORRUPTION",
        ))
        .await?;
        Ok(())
    }
}

async fn init_schema(conn: &Connection) -> Result<(), tokio_rusqlite::Error> {
    conn.call(|conn| {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS captured (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp  TEXT NOT NULL,
                port       TEXT NOT NULL,
                session_id TEXT NOT NULL,
                data       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_captured_timestamp ON captured(timestamp);
            CREATE INDEX IF NOT EXISTS idx_captured_port ON captured(port);
            CREATE INDEX IF NOT EXISTS idx_captured_session ON captured(session_id);
            CREATE INDEX IF NOT EXISTS idx_captured_ts_port ON captured(timestamp, port);
            ",
        )?;
        Ok(())
    })
    .await
}

fn is_corruption(err: &tokio_rusqlite::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("corrupt") || msg.contains("malform")
}

fn validate_read_only(sql: &str) -> Result<(), StoreError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_ascii_uppercase();
    if !upper.starts_with("SELECT") {
        return Err(StoreError::NotReadOnly);
    }
    let tokens: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect();
    if tokens.iter().any(|t| FORBIDDEN_KEYWORDS.contains(t)) {
        return Err(StoreError::NotReadOnly);
    }
    Ok(())
}

fn row_to_captured_line(row: &Row) -> rusqlite::Result<CapturedLine> {
    Ok(CapturedLine {
        id: Some(row.get(0)?),
        timestamp: row.get(1)?,
        port: row.get(2)?,
        session_id: row.get(3)?,
        data: row.get(4)?,
    })
}

fn row_to_json(row: &Row, col_names: &[String]) -> rusqlite::Result<Map<String, JsonValue>> {
    let mut map = Map::new();
    for (i, name) in col_names.iter().enumerate() {
        map.insert(name.clone(), sql_value_to_json(row.get_ref(i)?));
    }
    Ok(map)
}

fn sql_value_to_json(value: ValueRef) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(format!("<{} bytes>", b.len())),
    }
}

fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_store() -> (std::sync::Arc<CaptureStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial_data.db");
        let store = CaptureStore::open(
            &path,
            1000,
            Duration::from_secs(3600),
            "session_test_aaaaaaaa",
            ShutdownSignal::new(),
        )
        .await
        .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn append_now_is_immediately_durable() {
        let (store, _dir) = open_test_store().await;
        store
            .append_now(CapturedLine::marker("session_test_aaaaaaaa", "DAEMON_STARTED"))
            .await
            .unwrap();
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn buffered_append_flushes_on_explicit_flush() {
        let (store, _dir) = open_test_store().await;
        store
            .append(CapturedLine::new("COM3", "session_test_aaaaaaaa", "A"))
            .await
            .unwrap();
        assert_eq!(store.count(None).await.unwrap(), 0);
        store.flush().await.unwrap();
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn buffered_append_flushes_at_batch_size() {
        let (store, _dir) = open_test_store().await;
        for i in 0..FLUSH_BATCH_SIZE {
            store
                .append(CapturedLine::new("COM3", "s", format!("line{i}")))
                .await
                .unwrap();
        }
        assert_eq!(store.count(None).await.unwrap(), FLUSH_BATCH_SIZE as i64);
    }

    #[tokio::test]
    async fn recent_with_a_limit_smaller_than_the_window_keeps_the_newest_rows() {
        let (store, _dir) = open_test_store().await;
        for data in ["A", "B", "C", "D", "E"] {
            store
                .append_now(CapturedLine::new("COM3", "s1", data))
                .await
                .unwrap();
        }
        // All five rows fall inside a generous time window; limit=3 must
        // keep the three most recent (C, D, E), not the three oldest.
        let rows = store.recent(3600, None, None, 3).await.unwrap();
        let data: Vec<&str> = rows.iter().map(|r| r.data.as_str()).collect();
        assert_eq!(data, vec!["C", "D", "E"]);
    }

    #[tokio::test]
    async fn tail_returns_chronological_order() {
        let (store, _dir) = open_test_store().await;
        for data in ["A", "B", "C"] {
            store
                .append_now(CapturedLine::new("COM3", "s1", data))
                .await
                .unwrap();
        }
        let rows = store.tail(3, None, None).await.unwrap();
        let data: Vec<&str> = rows.iter().map(|r| r.data.as_str()).collect();
        assert_eq!(data, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn query_rejects_mutating_statements() {
        let (store, _dir) = open_test_store().await;
        let result = store.query("DELETE FROM captured", vec![]).await;
        assert!(matches!(result, Err(StoreError::NotReadOnly)));
    }

    #[tokio::test]
    async fn query_allows_count_select() {
        let (store, _dir) = open_test_store().await;
        let rows = store
            .query("SELECT COUNT(*) as n FROM captured", vec![])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn retention_keeps_only_max_records_newest_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial_data.db");
        let store = CaptureStore::open(
            &path,
            5,
            Duration::from_millis(50),
            "session_test_aaaaaaaa",
            ShutdownSignal::new(),
        )
        .await
        .unwrap();
        for i in 0..20 {
            store
                .append_now(CapturedLine::new("COM3", "s", format!("line{i}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.count(None).await.unwrap(), 5);
        let rows = store.tail(5, None, None).await.unwrap();
        let data: Vec<&str> = rows.iter().map(|r| r.data.as_str()).collect();
        assert_eq!(
            data,
            vec!["line15", "line16", "line17", "line18", "line19"]
        );
    }

    #[tokio::test]
    async fn empty_store_retention_is_noop() {
        let (store, _dir) = open_test_store().await;
        store.run_retention().await.unwrap();
        assert_eq!(store.count(None).await.unwrap(), 0);
    }
}
