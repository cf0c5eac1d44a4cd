use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tablehub_protocol::{Event, Row, Table};

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

/// Embedded single-file backend. `rusqlite::Connection` is `!Sync`, so all
/// access is serialized through a blocking mutex and run via
/// `spawn_blocking` — the same "keep blocking I/O off the async runtime"
/// shape the rest of this codebase uses for SQLite work.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Everything about a `Table` except `id` and `name`, which get their own
/// columns per the reference schema.
#[derive(Serialize, Deserialize)]
struct TableData {
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    EngineError::Sqlite(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(e.to_string()),
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Connection) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection mutex poisoned");
            f(&guard)
        })
        .await?
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ffi::ErrorCode::ConstraintViolation
    )
}

fn row_to_table(
    id: String,
    name: String,
    data_json: String,
    updated_at: String,
    version: i64,
) -> EngineResult<Table> {
    let data: TableData = serde_json::from_str(&data_json)?;
    let updated_at: DateTime<Utc> = updated_at
        .parse()
        .map_err(|_| EngineError::State("malformed updated_at timestamp"))?;
    Ok(Table {
        id,
        name,
        headers: data.headers,
        rows: data.rows,
        updated_at,
        version,
    })
}

fn row_to_event(
    id: i64,
    cursor: String,
    client_id: String,
    operation_json: String,
    server_ts: String,
) -> EngineResult<Event> {
    let operation: serde_json::Value = serde_json::from_str(&operation_json)?;
    let server_ts: DateTime<Utc> = server_ts
        .parse()
        .map_err(|_| EngineError::State("malformed server_ts timestamp"))?;
    Ok(Event {
        id,
        cursor,
        client_id,
        operation,
        server_ts,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
CREATE TABLE IF NOT EXISTS tables (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS sync_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cursor TEXT UNIQUE NOT NULL,
    client_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    server_ts TEXT NOT NULL,
    applied INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_sync_events_cursor ON sync_events(cursor);
CREATE INDEX IF NOT EXISTS idx_sync_events_ts ON sync_events(server_ts);
"#,
            )?;
            Ok(())
        })
        .await
    }

    async fn get_all_tables(&self) -> EngineResult<Vec<Table>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, data, updated_at, version FROM tables ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, name, data, updated_at, version) = row?;
                out.push(row_to_table(id, name, data, updated_at, version)?);
            }
            Ok(out)
        })
        .await
    }

    async fn get_table(&self, id: &str) -> EngineResult<Option<Table>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, data, updated_at, version FROM tables WHERE id = ?1",
                    params![id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, String>(3)?,
                            r.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((id, name, data, updated_at, version)) => {
                    Ok(Some(row_to_table(id, name, data, updated_at, version)?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn create_table(&self, table: &Table) -> EngineResult<()> {
        let id = table.id.clone();
        let name = table.name.clone();
        let data = serde_json::to_string(&TableData {
            headers: table.headers.clone(),
            rows: table.rows.clone(),
        })?;
        let updated_at = table.updated_at.to_rfc3339();
        let version = table.version;
        self.with_conn(move |conn| {
            let res = conn.execute(
                "INSERT INTO tables (id, name, data, updated_at, version) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, name, data, updated_at, version],
            );
            match res {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(EngineError::DuplicateTableId(id)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update_table(&self, id: &str, table: &Table) -> EngineResult<bool> {
        let id = id.to_string();
        let name = table.name.clone();
        let data = serde_json::to_string(&TableData {
            headers: table.headers.clone(),
            rows: table.rows.clone(),
        })?;
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE tables SET name = ?2, data = ?3, updated_at = ?4, version = version + 1 WHERE id = ?1",
                params![id, name, data, now],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn delete_table(&self, id: &str) -> EngineResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM tables WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }

    async fn append_event(
        &self,
        cursor: &str,
        client_id: &str,
        operation: &serde_json::Value,
    ) -> EngineResult<Event> {
        let cursor = cursor.to_string();
        let client_id = client_id.to_string();
        let operation = operation.clone();
        let operation_json = serde_json::to_string(&operation)?;
        let server_ts = Utc::now();
        let server_ts_str = server_ts.to_rfc3339();
        self.with_conn(move |conn| {
            let res = conn.execute(
                "INSERT INTO sync_events (cursor, client_id, operation, server_ts) VALUES (?1, ?2, ?3, ?4)",
                params![cursor, client_id, operation_json, server_ts_str],
            );
            let id = match res {
                Ok(_) => conn.last_insert_rowid(),
                Err(e) if is_unique_violation(&e) => {
                    return Err(EngineError::DuplicateCursor(cursor))
                }
                Err(e) => return Err(e.into()),
            };
            Ok(Event {
                id,
                cursor,
                client_id,
                operation,
                server_ts,
            })
        })
        .await
    }

    async fn events_since(&self, cursor: &str, limit: i64) -> EngineResult<Vec<Event>> {
        let cursor = cursor.to_string();
        self.with_conn(move |conn| {
            let mut stmt = if cursor == tablehub_protocol::ROOT_CURSOR {
                conn.prepare(
                    "SELECT id, cursor, client_id, operation, server_ts FROM sync_events ORDER BY id ASC LIMIT ?1",
                )?
            } else {
                conn.prepare(
                    "SELECT id, cursor, client_id, operation, server_ts FROM sync_events
                     WHERE id > (SELECT id FROM sync_events WHERE cursor = ?2)
                     ORDER BY id ASC LIMIT ?1",
                )?
            };
            let rows = if cursor == tablehub_protocol::ROOT_CURSOR {
                stmt.query_map(params![limit], read_event_row)?
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                stmt.query_map(params![limit, cursor], read_event_row)?
                    .collect::<Result<Vec<_>, _>>()?
            };
            rows.into_iter()
                .map(|(id, cursor, client_id, op, ts)| row_to_event(id, cursor, client_id, op, ts))
                .collect()
        })
        .await
    }

    async fn recent_events(&self, limit: i64) -> EngineResult<Vec<Event>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, cursor, client_id, operation, server_ts FROM sync_events ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], read_event_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, cursor, client_id, op, ts)| row_to_event(id, cursor, client_id, op, ts))
                .collect()
        })
        .await
    }

    async fn latest_cursor(&self) -> EngineResult<String> {
        self.with_conn(|conn| {
            let cursor: Option<String> = conn
                .query_row(
                    "SELECT cursor FROM sync_events ORDER BY id DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(cursor.unwrap_or_else(|| tablehub_protocol::ROOT_CURSOR.to_string()))
        })
        .await
    }

    async fn reset(&self) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM tables", [])?;
            conn.execute("DELETE FROM sync_events", [])?;
            conn.execute(
                "DELETE FROM sqlite_sequence WHERE name = 'sync_events'",
                [],
            )?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
            Ok(())
        })
        .await
    }
}

type EventRow = (i64, String, String, String, String);

fn read_event_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
    ))
}
