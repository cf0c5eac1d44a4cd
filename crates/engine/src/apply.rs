//! Per-operation semantics: given a mutation and the current materialized
//! table, produce the new materialized table or reject. Pure — no Store
//! access happens here; the Coordinator reads the Table beforehand and
//! persists it afterward.

use tablehub_protocol::{CellMeta, Operation, Row, Table};

/// Outcome of applying a single operation. `Conflict` is the "apply-failed"
/// channel of the three-way split in the failure model: missing
/// preconditions, not internal errors. An LWW loss is `Applied` — the
/// operation was accepted, it simply didn't change anything, because the
/// server's state already reflects the winning write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Conflict(&'static str),
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Apply `op` to `table` in place. Panics if called with
/// [`Operation::DeleteTable`] — that variant bypasses the materialized-table
/// read entirely and is handled by the Coordinator directly against the
/// Store (see the Open Question resolution in the design notes).
pub fn apply(table: &mut Table, op: &Operation, client_id: &str) -> ApplyOutcome {
    match op {
        Operation::SetCell {
            row_id,
            col,
            value,
            ts,
            ..
        } => apply_set_cell(table, row_id, *col, value, *ts, client_id),
        Operation::AddRow {
            row_id,
            after_row_id,
            ..
        } => apply_add_row(table, row_id, after_row_id.as_deref()),
        Operation::DeleteRow { row_id, .. } => apply_delete_row(table, row_id),
        Operation::AddColumn {
            col_index, header, ..
        } => apply_add_column(table, *col_index, header.as_deref()),
        Operation::DeleteColumn { col_index, .. } => apply_delete_column(table, *col_index),
        Operation::SetHeader {
            col_index, header, ..
        } => apply_set_header(table, *col_index, header),
        Operation::RenameTable { name, .. } => apply_rename_table(table, name),
        Operation::DeleteTable { .. } => {
            unreachable!("deleteTable bypasses the Applier; the Coordinator calls Store::delete_table directly")
        }
    }
}

fn apply_set_cell(
    table: &mut Table,
    row_id: &str,
    col: i64,
    value: &str,
    ts: i64,
    client_id: &str,
) -> ApplyOutcome {
    let Ok(col) = usize::try_from(col) else {
        return ApplyOutcome::Conflict("column index out of range");
    };
    let Some(row) = table.rows.iter_mut().find(|r| r.row_id == row_id) else {
        return ApplyOutcome::Conflict("row not found");
    };
    if row.cells.len() <= col {
        row.cells.resize(col + 1, String::new());
    }
    if row.cell_meta.len() <= col {
        row.cell_meta.resize(col + 1, None);
    }

    // LWW: apply unconditionally if there's no prior write (or it carries no
    // timestamp), otherwise compare (ts, clientId) lexicographically against
    // the stored metadata. A loss here is silent, not a conflict — the
    // server already holds the winning value.
    let should_apply = match &row.cell_meta[col] {
        None => true,
        Some(meta) if meta.ts == 0 => true,
        Some(meta) => (ts, client_id) > (meta.ts, meta.by.as_str()),
    };

    if should_apply {
        row.cells[col] = value.to_string();
        row.cell_meta[col] = Some(CellMeta {
            value: value.to_string(),
            ts,
            by: client_id.to_string(),
        });
    }
    ApplyOutcome::Applied
}

fn apply_add_row(table: &mut Table, row_id: &str, after_row_id: Option<&str>) -> ApplyOutcome {
    if table.rows.iter().any(|r| r.row_id == row_id) {
        return ApplyOutcome::Applied; // idempotent: already present
    }
    let new_row = Row::new(row_id, table.headers.len());
    match after_row_id.and_then(|after| table.rows.iter().position(|r| r.row_id == after)) {
        Some(pos) => table.rows.insert(pos + 1, new_row),
        None => table.rows.push(new_row),
    }
    ApplyOutcome::Applied
}

fn apply_delete_row(table: &mut Table, row_id: &str) -> ApplyOutcome {
    table.rows.retain(|r| r.row_id != row_id); // missing id: idempotent no-op
    ApplyOutcome::Applied
}

fn apply_add_column(table: &mut Table, col_index: Option<i64>, header: Option<&str>) -> ApplyOutcome {
    let len = table.headers.len();
    let idx = col_index
        .and_then(|i| usize::try_from(i).ok())
        .map(|i| i.min(len))
        .unwrap_or(len);
    let header = header
        .map(str::to_string)
        .unwrap_or_else(|| format!("Column {}", idx + 1));

    table.headers.insert(idx, header);
    for row in &mut table.rows {
        let cell_idx = idx.min(row.cells.len());
        row.cells.insert(cell_idx, String::new());
        let meta_idx = idx.min(row.cell_meta.len());
        row.cell_meta.insert(meta_idx, None);
    }
    ApplyOutcome::Applied
}

fn apply_delete_column(table: &mut Table, col_index: i64) -> ApplyOutcome {
    let Ok(idx) = usize::try_from(col_index) else {
        return ApplyOutcome::Conflict("column index out of range");
    };
    if idx >= table.headers.len() {
        return ApplyOutcome::Conflict("column index out of range");
    }
    table.headers.remove(idx);
    for row in &mut table.rows {
        if idx < row.cells.len() {
            row.cells.remove(idx);
        }
        if idx < row.cell_meta.len() {
            row.cell_meta.remove(idx);
        }
    }
    ApplyOutcome::Applied
}

fn apply_set_header(table: &mut Table, col_index: i64, header: &str) -> ApplyOutcome {
    let Ok(idx) = usize::try_from(col_index) else {
        return ApplyOutcome::Conflict("column index out of range");
    };
    if idx >= table.headers.len() {
        return ApplyOutcome::Conflict("column index out of range");
    }
    table.headers[idx] = header.to_string();
    ApplyOutcome::Applied
}

fn apply_rename_table(table: &mut Table, name: &str) -> ApplyOutcome {
    if name.is_empty() {
        return ApplyOutcome::Conflict("table name must not be empty");
    }
    table.name = name.to_string();
    ApplyOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_row() -> Table {
        let mut t = Table::new("t1", "Sheet", vec!["A".to_string()]);
        t.rows.push(Row::new("r1", 1));
        t
    }

    #[test]
    fn lww_tiebreak_by_client_id_same_ts() {
        let mut t1 = table_with_row();
        apply_set_cell(&mut t1, "r1", 0, "x", 100, "alice");
        apply_set_cell(&mut t1, "r1", 0, "y", 100, "bob");
        assert_eq!(t1.rows[0].cells[0], "y");

        // Same pair in reverse arrival order must converge to the same value.
        let mut t2 = table_with_row();
        apply_set_cell(&mut t2, "r1", 0, "y", 100, "bob");
        apply_set_cell(&mut t2, "r1", 0, "x", 100, "alice");
        assert_eq!(t2.rows[0].cells[0], "y");
    }

    #[test]
    fn lww_later_timestamp_wins_regardless_of_order() {
        let mut t1 = table_with_row();
        apply_set_cell(&mut t1, "r1", 0, "x", 200, "alice");
        apply_set_cell(&mut t1, "r1", 0, "y", 100, "bob");
        assert_eq!(t1.rows[0].cells[0], "x");

        let mut t2 = table_with_row();
        apply_set_cell(&mut t2, "r1", 0, "y", 100, "bob");
        apply_set_cell(&mut t2, "r1", 0, "x", 200, "alice");
        assert_eq!(t2.rows[0].cells[0], "x");
    }

    #[test]
    fn lww_loss_is_applied_not_conflict() {
        let mut t = table_with_row();
        apply_set_cell(&mut t, "r1", 0, "winner", 200, "zzz");
        let outcome = apply_set_cell(&mut t, "r1", 0, "loser", 100, "aaa");
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(t.rows[0].cells[0], "winner");
    }

    #[test]
    fn set_cell_pads_row_to_target_column() {
        let mut t = Table::new("t1", "Sheet", vec!["A".to_string(), "B".to_string()]);
        t.rows.push(Row::new("r1", 2));
        apply_set_cell(&mut t, "r1", 5, "v", 1, "alice");
        assert_eq!(
            t.rows[0].cells,
            vec!["", "", "", "", "", "v"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn set_cell_missing_row_is_conflict() {
        let mut t = table_with_row();
        let outcome = apply_set_cell(&mut t, "ghost", 0, "v", 1, "alice");
        assert_eq!(outcome, ApplyOutcome::Conflict("row not found"));
    }

    #[test]
    fn add_row_is_idempotent() {
        let mut t = table_with_row();
        let before = t.rows.len();
        let outcome = apply_add_row(&mut t, "r1", None);
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(t.rows.len(), before);
    }

    #[test]
    fn add_row_inserts_after_target() {
        let mut t = Table::new("t1", "Sheet", vec!["A".to_string()]);
        t.rows.push(Row::new("r1", 1));
        t.rows.push(Row::new("r2", 1));
        apply_add_row(&mut t, "r1.5", Some("r1"));
        let ids: Vec<_> = t.rows.iter().map(|r| r.row_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r1.5", "r2"]);
    }

    #[test]
    fn delete_missing_row_is_idempotent_success() {
        let mut t = table_with_row();
        let outcome = apply_delete_row(&mut t, "ghost");
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn add_column_pads_every_row() {
        let mut t = Table::new("t1", "Sheet", vec!["A".to_string()]);
        t.rows.push(Row::new("r1", 1));
        apply_add_column(&mut t, None, None);
        assert_eq!(t.headers, vec!["A", "Column 2"]);
        assert_eq!(t.rows[0].cells.len(), 2);
    }

    #[test]
    fn delete_column_out_of_range_is_conflict() {
        let mut t = Table::new("t1", "Sheet", vec!["A".to_string()]);
        let outcome = apply_delete_column(&mut t, 5);
        assert_eq!(outcome, ApplyOutcome::Conflict("column index out of range"));
    }

    #[test]
    fn rename_table_rejects_empty_name() {
        let mut t = Table::new("t1", "Sheet", vec![]);
        let outcome = apply_rename_table(&mut t, "");
        assert_eq!(
            outcome,
            ApplyOutcome::Conflict("table name must not be empty")
        );
    }
}
