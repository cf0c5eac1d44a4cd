use async_trait::async_trait;
use tablehub_protocol::{Event, Table};

use crate::error::EngineResult;

/// Durable persistence of materialized tables and an append-only event log
/// with monotonic event identifiers. A single interface, selected at
/// construction time by the `DATABASE_URL` scheme — never branched on per
/// call.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the persistence schema if absent. Idempotent.
    async fn init(&self) -> EngineResult<()>;

    /// Every Table, ordered by most recently updated first.
    async fn get_all_tables(&self) -> EngineResult<Vec<Table>>;

    /// The materialized Table, or `None` if absent.
    async fn get_table(&self, id: &str) -> EngineResult<Option<Table>>;

    /// Insert a new table. Fails if `table.id` collides.
    async fn create_table(&self, table: &Table) -> EngineResult<()>;

    /// Overwrite a table, bumping `version` and `updated_at`. Returns
    /// whether a row matched `id`.
    async fn update_table(&self, id: &str, table: &Table) -> EngineResult<bool>;

    /// Remove a table. Returns whether a row matched.
    async fn delete_table(&self, id: &str) -> EngineResult<bool>;

    /// Insert an event with a server-assigned monotonic `id` and
    /// `server_ts = now()`. `cursor` must be unique; a duplicate fails.
    async fn append_event(
        &self,
        cursor: &str,
        client_id: &str,
        operation: &serde_json::Value,
    ) -> EngineResult<Event>;

    /// Events with `id` strictly greater than the one `cursor` resolves to,
    /// ascending, up to `limit`. `cursor == "0"` means "from the
    /// beginning". A `cursor` that resolves to no event yields an empty
    /// scan, not an error.
    async fn events_since(&self, cursor: &str, limit: i64) -> EngineResult<Vec<Event>>;

    /// Events by `id` descending, up to `limit`.
    async fn recent_events(&self, limit: i64) -> EngineResult<Vec<Event>>;

    /// Cursor of the highest-`id` event, or `"0"` if the log is empty.
    async fn latest_cursor(&self) -> EngineResult<String>;

    /// Delete all tables and all events; reset identifier sequences.
    async fn reset(&self) -> EngineResult<()>;

    /// Flush and release resources. Idempotent; safe to call during shutdown
    /// even if no writes are pending.
    async fn close(&self) -> EngineResult<()>;
}
