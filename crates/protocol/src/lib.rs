//! Wire and domain types shared between the sync engine and the HTTP surface.
//!
//! Nothing in this crate touches storage or the network; it only describes
//! the shapes that cross those boundaries, so the engine and server crates
//! can agree on them without duplicating `serde` impls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata attached to a single cell, used only for LWW tiebreaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMeta {
    pub value: String,
    pub ts: i64,
    pub by: String,
}

/// A single row in a [`Table`]. `cells` is always padded to `headers.len()`
/// after any applied operation; `cell_meta` may be shorter (missing trailing
/// entries are absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub row_id: String,
    pub cells: Vec<String>,
    #[serde(default)]
    pub cell_meta: Vec<Option<CellMeta>>,
}

impl Row {
    pub fn new(row_id: impl Into<String>, num_cols: usize) -> Self {
        Self {
            row_id: row_id.into(),
            cells: vec![String::new(); num_cols],
            cell_meta: Vec::new(),
        }
    }

    /// Metadata for `col`, or `None` if the row has no entry that far.
    pub fn meta_at(&self, col: usize) -> Option<&CellMeta> {
        self.cell_meta.get(col).and_then(|m| m.as_ref())
    }
}

/// A named two-dimensional tabular document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Table {
    pub fn new(id: impl Into<String>, name: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            headers,
            rows: Vec::new(),
            updated_at: Utc::now(),
            version: 1,
        }
    }
}

/// Tagged union over the mutation language described in the synchronization
/// engine's operation model. Each variant carries only the fields that
/// operation actually uses, so illegal combinations (e.g. `setCell` with no
/// `col`) are unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    SetCell {
        table_id: String,
        row_id: String,
        col: i64,
        value: String,
        ts: i64,
    },
    AddRow {
        table_id: String,
        row_id: String,
        #[serde(default)]
        after_row_id: Option<String>,
        ts: i64,
    },
    DeleteRow {
        table_id: String,
        row_id: String,
        ts: i64,
    },
    AddColumn {
        table_id: String,
        #[serde(default)]
        col_index: Option<i64>,
        #[serde(default)]
        header: Option<String>,
        ts: i64,
    },
    DeleteColumn {
        table_id: String,
        col_index: i64,
        ts: i64,
    },
    SetHeader {
        table_id: String,
        col_index: i64,
        header: String,
        ts: i64,
    },
    RenameTable {
        table_id: String,
        name: String,
        ts: i64,
    },
    DeleteTable {
        table_id: String,
        ts: i64,
    },
}

impl Operation {
    pub fn table_id(&self) -> &str {
        match self {
            Operation::SetCell { table_id, .. }
            | Operation::AddRow { table_id, .. }
            | Operation::DeleteRow { table_id, .. }
            | Operation::AddColumn { table_id, .. }
            | Operation::DeleteColumn { table_id, .. }
            | Operation::SetHeader { table_id, .. }
            | Operation::RenameTable { table_id, .. }
            | Operation::DeleteTable { table_id, .. } => table_id,
        }
    }
}

/// A conflict reported back to the pushing client: the operation failed to
/// apply (missing target, out-of-range index, unknown `op`, ...). This is
/// never raised for an LWW loss — the server's state already reflects the
/// winner in that case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub operation: serde_json::Value,
    pub reason: String,
}

/// Immutable record written to the event log for every operation that was
/// successfully applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub cursor: String,
    pub client_id: String,
    pub operation: serde_json::Value,
    pub server_ts: DateTime<Utc>,
}

/// Wire projection of an [`Event`] for delivery to other clients: the
/// operation payload plus `serverTs` and the originator's `clientId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    #[serde(flatten)]
    pub operation: serde_json::Value,
    pub server_ts: DateTime<Utc>,
    pub by: String,
}

impl Delta {
    pub fn from_event(event: &Event) -> Self {
        Self {
            operation: event.operation.clone(),
            server_ts: event.server_ts,
            by: event.client_id.clone(),
        }
    }
}

/// Body of `POST /api/sync`. `ops` is kept as raw JSON at this layer so an
/// unknown `op` value fails to parse as a single [`Operation`] (and is
/// reported as a per-op conflict) rather than rejecting the whole batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub client_id: String,
    pub base_cursor: String,
    pub ops: Vec<serde_json::Value>,
}

/// Response of `POST /api/sync`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub cursor: String,
    pub deltas: Vec<Delta>,
    pub conflicts: Vec<Conflict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `GET /api/sync?since=`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub cursor: String,
    pub deltas: Vec<Delta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<Table>>,
}

/// The documented "from the beginning" cursor.
pub const ROOT_CURSOR: &str = "0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cell_round_trips_through_json() {
        let op = Operation::SetCell {
            table_id: "t1".into(),
            row_id: "r1".into(),
            col: 2,
            value: "x".into(),
            ts: 100,
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["op"], "setCell");
        assert_eq!(v["tableId"], "t1");
        let back: Operation = serde_json::from_value(v).unwrap();
        assert_eq!(back.table_id(), "t1");
    }

    #[test]
    fn unknown_op_fails_to_parse_as_operation() {
        let raw = serde_json::json!({"op": "frobnicate", "tableId": "t1"});
        assert!(serde_json::from_value::<Operation>(raw).is_err());
    }

    #[test]
    fn delta_flattens_operation_fields() {
        let event = Event {
            id: 1,
            cursor: "0_abc".into(),
            client_id: "alice".into(),
            operation: serde_json::json!({"op": "setCell", "tableId": "t1"}),
            server_ts: Utc::now(),
        };
        let delta = Delta::from_event(&event);
        let v = serde_json::to_value(&delta).unwrap();
        assert_eq!(v["op"], "setCell");
        assert_eq!(v["by"], "alice");
        assert!(v.get("serverTs").is_some());
    }
}
