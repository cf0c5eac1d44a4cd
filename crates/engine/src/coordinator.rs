//! Ties the Store, Applier, and Cursor Generator together into the two
//! operations the HTTP surface exposes: push (`process_sync`) and pull
//! (`get_changes_since`).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use tablehub_protocol::{Conflict, Delta, Operation, PullResponse, SyncResponse, ROOT_CURSOR};

use crate::apply::{apply, ApplyOutcome};
use crate::cursor;
use crate::error::EngineResult;
use crate::store::Store;

/// Orchestrates push/pull against a `Store`, serializing the
/// read-apply-write sequence per table so two concurrent pushes targeting
/// the same table can't interleave their `get_table`/`update_table` pair.
/// A connection-pooled backend (Postgres) allows genuine concurrency a
/// single SQLite connection wouldn't, so this lock is needed uniformly
/// across backends rather than relying on storage-level serialization.
///
/// Holds `Arc<dyn Store>` rather than a type parameter: the backend is
/// chosen once at process startup from `DATABASE_URL`, and everything above
/// this point only ever talks to the trait.
pub struct SyncCoordinator {
    store: Arc<dyn Store>,
    table_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            table_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn lock_for(&self, table_id: &str) -> Arc<AsyncMutex<()>> {
        self.table_locks
            .entry(table_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Push a batch of operations from `client_id`. Each op is applied
    /// under its table's lock; ops that fail to parse as a known
    /// [`Operation`], or whose precondition the Applier rejects, become
    /// conflicts instead of aborting the rest of the batch. Every
    /// successfully-applied op is appended to the event log before the
    /// response cursor is read, so the returned cursor always reflects this
    /// push's own writes.
    pub async fn process_sync(
        &self,
        client_id: &str,
        base_cursor: &str,
        ops: Vec<serde_json::Value>,
    ) -> EngineResult<SyncResponse> {
        let mut conflicts = Vec::new();

        for raw_op in ops {
            let op: Operation = match serde_json::from_value(raw_op.clone()) {
                Ok(op) => op,
                Err(e) => {
                    conflicts.push(Conflict {
                        operation: raw_op,
                        reason: format!("unrecognized operation: {e}"),
                    });
                    continue;
                }
            };

            match self.apply_and_record(client_id, &op, &raw_op).await? {
                Ok(()) => {}
                Err(reason) => conflicts.push(Conflict {
                    operation: raw_op,
                    reason: reason.to_string(),
                }),
            }
        }

        let events = self.store.events_since(base_cursor, i64::MAX).await?;
        let deltas = events
            .into_iter()
            .filter(|e| e.client_id != client_id)
            .map(|e| Delta::from_event(&e))
            .collect();
        let cursor = self.store.latest_cursor().await?;

        Ok(SyncResponse {
            success: true,
            cursor,
            deltas,
            conflicts,
            error: None,
        })
    }

    /// Apply `op` against its table and append the resulting event. Returns
    /// `Ok(Err(reason))` for an apply-failed precondition (a conflict, not
    /// an error); propagates storage faults via `?`.
    async fn apply_and_record(
        &self,
        client_id: &str,
        op: &Operation,
        raw_op: &serde_json::Value,
    ) -> EngineResult<Result<(), &'static str>> {
        let table_id = op.table_id().to_string();
        let lock = self.lock_for(&table_id);
        let _guard = lock.lock().await;

        match op {
            // Bypasses the materialized-table read entirely: deleting a
            // table that doesn't exist is a no-op, same as any other
            // delete in this operation model.
            Operation::DeleteTable { .. } => {
                self.store.delete_table(&table_id).await?;
            }
            _ => {
                let Some(mut table) = self.store.get_table(&table_id).await? else {
                    return Ok(Err("table not found"));
                };
                match apply(&mut table, op, client_id) {
                    ApplyOutcome::Conflict(reason) => return Ok(Err(reason)),
                    ApplyOutcome::Applied => {
                        self.store.update_table(&table_id, &table).await?;
                    }
                }
            }
        }

        let ts = Utc::now();
        let op_json = serde_json::to_string(raw_op)?;
        let cursor = cursor::generate(ts, client_id, &op_json);
        self.store.append_event(&cursor, client_id, raw_op).await?;
        Ok(Ok(()))
    }

    /// Pull events after `cursor`, up to `limit`. When `cursor` is the root
    /// cursor (a client with no local state yet), the full set of
    /// materialized tables is included alongside the deltas so the caller
    /// can bootstrap without replaying the entire log.
    pub async fn get_changes_since(&self, cursor: &str, limit: i64) -> EngineResult<PullResponse> {
        let events = self.store.events_since(cursor, limit).await?;
        let next_cursor = events
            .last()
            .map(|e| e.cursor.clone())
            .unwrap_or_else(|| cursor.to_string());
        let deltas = events.iter().map(Delta::from_event).collect();
        let tables = if cursor == ROOT_CURSOR {
            Some(self.store.get_all_tables().await?)
        } else {
            None
        };
        Ok(PullResponse {
            cursor: next_cursor,
            deltas,
            tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteStore;
    use tablehub_protocol::Table;

    async fn coordinator_with_table(table_id: &str) -> SyncCoordinator {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init().await.unwrap();
        store
            .create_table(&Table::new(table_id, "Sheet", vec!["A".to_string()]))
            .await
            .unwrap();
        SyncCoordinator::new(Arc::new(store))
    }

    fn set_cell_op(table_id: &str, row_id: &str, value: &str, ts: i64) -> serde_json::Value {
        serde_json::json!({
            "op": "setCell",
            "tableId": table_id,
            "rowId": row_id,
            "col": 0,
            "value": value,
            "ts": ts,
        })
    }

    #[tokio::test]
    async fn unknown_op_is_conflict_not_whole_batch_failure() {
        let coord = coordinator_with_table("t1").await;
        let ops = vec![serde_json::json!({"op": "frobnicate", "tableId": "t1"})];
        let resp = coord.process_sync("alice", ROOT_CURSOR, ops).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.conflicts.len(), 1);
    }

    #[tokio::test]
    async fn missing_row_is_conflict() {
        let coord = coordinator_with_table("t1").await;
        let ops = vec![set_cell_op("t1", "ghost", "v", 1)];
        let resp = coord.process_sync("alice", ROOT_CURSOR, ops).await.unwrap();
        assert_eq!(resp.conflicts.len(), 1);
        assert_eq!(resp.conflicts[0].reason, "row not found");
    }

    #[tokio::test]
    async fn push_excludes_own_events_from_deltas() {
        let coord = coordinator_with_table("t1").await;
        let add_row = serde_json::json!({"op": "addRow", "tableId": "t1", "rowId": "r1", "ts": 1});
        coord
            .process_sync("alice", ROOT_CURSOR, vec![add_row])
            .await
            .unwrap();

        let set_cell = set_cell_op("t1", "r1", "hi", 2);
        let resp = coord
            .process_sync("alice", ROOT_CURSOR, vec![set_cell])
            .await
            .unwrap();
        // alice's own two pushes must not show up as deltas to alice.
        assert!(resp.deltas.is_empty());
    }

    #[tokio::test]
    async fn pull_includes_tables_only_at_root_cursor() {
        let coord = coordinator_with_table("t1").await;
        let add_row = serde_json::json!({"op": "addRow", "tableId": "t1", "rowId": "r1", "ts": 1});
        let resp = coord
            .process_sync("alice", ROOT_CURSOR, vec![add_row])
            .await
            .unwrap();

        let from_root = coord.get_changes_since(ROOT_CURSOR, 100).await.unwrap();
        assert!(from_root.tables.is_some());

        let from_cursor = coord.get_changes_since(&resp.cursor, 100).await.unwrap();
        assert!(from_cursor.tables.is_none());
        assert!(from_cursor.deltas.is_empty());
    }

    #[tokio::test]
    async fn delete_table_bypasses_table_read() {
        let coord = coordinator_with_table("t1").await;
        let delete = serde_json::json!({"op": "deleteTable", "tableId": "ghost-table", "ts": 1});
        let resp = coord.process_sync("alice", ROOT_CURSOR, vec![delete]).await.unwrap();
        assert!(resp.conflicts.is_empty());
    }
}
