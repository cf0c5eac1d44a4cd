use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row as _};
use tablehub_protocol::{Event, Row, Table};

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

/// Networked relational backend, selected when `DATABASE_URL` starts with
/// `postgresql://`. Ordering comes from `BIGSERIAL` plus transactional
/// inserts, same contract as [`crate::sqlite_store::SqliteStore`].
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(Serialize, Deserialize)]
struct TableData {
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|e| e.code()),
        Some(code) if code == "23505"
    )
}

fn row_to_table(
    id: String,
    name: String,
    data: serde_json::Value,
    updated_at: DateTime<Utc>,
    version: i64,
) -> EngineResult<Table> {
    let data: TableData = serde_json::from_value(data)?;
    Ok(Table {
        id,
        name,
        headers: data.headers,
        rows: data.rows,
        updated_at,
        version,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn init(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS tables (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    data JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    version INTEGER NOT NULL DEFAULT 1
)
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS sync_events (
    id BIGSERIAL PRIMARY KEY,
    cursor TEXT UNIQUE NOT NULL,
    client_id TEXT NOT NULL,
    operation JSONB NOT NULL,
    server_ts TIMESTAMPTZ NOT NULL DEFAULT now(),
    applied BOOLEAN NOT NULL DEFAULT TRUE
)
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_events_cursor ON sync_events(cursor)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_events_ts ON sync_events(server_ts)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_all_tables(&self) -> EngineResult<Vec<Table>> {
        let rows = sqlx::query("SELECT id, name, data, updated_at, version FROM tables ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                row_to_table(
                    r.try_get("id")?,
                    r.try_get("name")?,
                    r.try_get("data")?,
                    r.try_get("updated_at")?,
                    r.try_get("version")?,
                )
            })
            .collect()
    }

    async fn get_table(&self, id: &str) -> EngineResult<Option<Table>> {
        let row = sqlx::query("SELECT id, name, data, updated_at, version FROM tables WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(row_to_table(
                r.try_get("id")?,
                r.try_get("name")?,
                r.try_get("data")?,
                r.try_get("updated_at")?,
                r.try_get("version")?,
            )?)),
            None => Ok(None),
        }
    }

    async fn create_table(&self, table: &Table) -> EngineResult<()> {
        let data = serde_json::to_value(TableData {
            headers: table.headers.clone(),
            rows: table.rows.clone(),
        })?;
        let res = sqlx::query(
            "INSERT INTO tables (id, name, data, updated_at, version) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&table.id)
        .bind(&table.name)
        .bind(data)
        .bind(table.updated_at)
        .bind(table.version)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(EngineError::DuplicateTableId(table.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_table(&self, id: &str, table: &Table) -> EngineResult<bool> {
        let data = serde_json::to_value(TableData {
            headers: table.headers.clone(),
            rows: table.rows.clone(),
        })?;
        let result = sqlx::query(
            "UPDATE tables SET name = $2, data = $3, updated_at = now(), version = version + 1 WHERE id = $1",
        )
        .bind(id)
        .bind(&table.name)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_table(&self, id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM tables WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_event(
        &self,
        cursor: &str,
        client_id: &str,
        operation: &serde_json::Value,
    ) -> EngineResult<Event> {
        let res = sqlx::query(
            "INSERT INTO sync_events (cursor, client_id, operation) VALUES ($1, $2, $3) RETURNING id, server_ts",
        )
        .bind(cursor)
        .bind(client_id)
        .bind(operation)
        .fetch_one(&self.pool)
        .await;
        let row = match res {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                return Err(EngineError::DuplicateCursor(cursor.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Event {
            id: row.try_get("id")?,
            cursor: cursor.to_string(),
            client_id: client_id.to_string(),
            operation: operation.clone(),
            server_ts: row.try_get("server_ts")?,
        })
    }

    async fn events_since(&self, cursor: &str, limit: i64) -> EngineResult<Vec<Event>> {
        let rows = if cursor == tablehub_protocol::ROOT_CURSOR {
            sqlx::query(
                "SELECT id, cursor, client_id, operation, server_ts FROM sync_events ORDER BY id ASC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, cursor, client_id, operation, server_ts FROM sync_events
                 WHERE id > (SELECT id FROM sync_events WHERE cursor = $2)
                 ORDER BY id ASC LIMIT $1",
            )
            .bind(limit)
            .bind(cursor)
            .fetch_all(&self.pool)
            .await?
        };
        rows.into_iter()
            .map(|r| {
                Ok(Event {
                    id: r.try_get("id")?,
                    cursor: r.try_get("cursor")?,
                    client_id: r.try_get("client_id")?,
                    operation: r.try_get("operation")?,
                    server_ts: r.try_get("server_ts")?,
                })
            })
            .collect()
    }

    async fn recent_events(&self, limit: i64) -> EngineResult<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT id, cursor, client_id, operation, server_ts FROM sync_events ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Event {
                    id: r.try_get("id")?,
                    cursor: r.try_get("cursor")?,
                    client_id: r.try_get("client_id")?,
                    operation: r.try_get("operation")?,
                    server_ts: r.try_get("server_ts")?,
                })
            })
            .collect()
    }

    async fn latest_cursor(&self) -> EngineResult<String> {
        let row = sqlx::query("SELECT cursor FROM sync_events ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(r.try_get("cursor")?),
            None => Ok(tablehub_protocol::ROOT_CURSOR.to_string()),
        }
    }

    async fn reset(&self) -> EngineResult<()> {
        sqlx::query("TRUNCATE tables, sync_events RESTART IDENTITY")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
