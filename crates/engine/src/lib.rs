//! Synchronization engine: the Store trait and its two backends, the
//! Applier, the Cursor Generator, and the Coordinator that ties them into
//! push/pull. Nothing here knows about HTTP; `tablehub-server` is the only
//! caller.

mod apply;
mod coordinator;
mod cursor;
mod error;
mod postgres_store;
mod sqlite_store;
mod store;

pub use apply::{apply, ApplyOutcome};
pub use coordinator::SyncCoordinator;
pub use error::{EngineError, EngineResult};
pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;
pub use store::Store;

use std::path::Path;
use std::sync::Arc;

/// Open the backend named by `database_url`: `postgresql://...` or
/// `postgres://...` selects [`PostgresStore`], anything else is treated as
/// a filesystem path for [`SqliteStore`]. Selected once at process startup;
/// nothing downstream branches on the backend again.
pub async fn open_store(database_url: &str) -> EngineResult<Arc<dyn Store>> {
    let store: Arc<dyn Store> = if database_url.starts_with("postgresql://")
        || database_url.starts_with("postgres://")
    {
        Arc::new(PostgresStore::connect(database_url).await?)
    } else {
        Arc::new(SqliteStore::open(Path::new(database_url))?)
    };
    store.init().await?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_store_initializes_schema_for_sqlite_path() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init().await.unwrap();
        assert_eq!(store.latest_cursor().await.unwrap(), tablehub_protocol::ROOT_CURSOR);
    }
}
