//! Row abstraction shared by the scanner and the concurrent-DML hook.
//!
//! Both sides treat a row as the capability set {row type, hKey,
//! field(i)}. Three implementations exist:
//!
//! - [`BoundRow`] — decoded store payload bound to a row type and hKey.
//! - [`OverlayRow`] — re-types a backing row without touching its fields
//!   or its hKey; sufficient when only metadata changed.
//! - [`ProjectedRow`] — the output of a compiled projection: evaluated
//!   fields under the new row type, with a freshly derived hKey.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::GroupShiftError;
use crate::hkey::HKey;
use crate::schema::{RowType, Schema, TableId};
use crate::types::Value;

/// Abstract row capability set.
pub trait Row: Send + Sync {
    fn row_type(&self) -> &Arc<RowType>;
    fn h_key(&self) -> &HKey;
    fn field(&self, i: usize) -> &Value;

    /// Materialize the fields, in position order.
    fn fields(&self) -> Vec<Value> {
        (0..self.row_type().field_count())
            .map(|i| self.field(i).clone())
            .collect()
    }
}

// ── BoundRow ───────────────────────────────────────────────────────────────

/// A decoded store row.
#[derive(Debug, Clone)]
pub struct BoundRow {
    row_type: Arc<RowType>,
    hkey: HKey,
    values: Vec<Value>,
}

impl BoundRow {
    pub fn new(row_type: Arc<RowType>, hkey: HKey, values: Vec<Value>) -> Self {
        debug_assert_eq!(row_type.field_count(), values.len());
        BoundRow {
            row_type,
            hkey,
            values,
        }
    }
}

impl Row for BoundRow {
    fn row_type(&self) -> &Arc<RowType> {
        &self.row_type
    }

    fn h_key(&self) -> &HKey {
        &self.hkey
    }

    fn field(&self, i: usize) -> &Value {
        &self.values[i]
    }
}

// ── OverlayRow ─────────────────────────────────────────────────────────────

/// Re-types a backing row. Fields and hKey pass through untouched, so
/// the overlay keeps the pre-image row's identity.
pub struct OverlayRow {
    backing: Box<dyn Row>,
    row_type: Arc<RowType>,
}

impl OverlayRow {
    pub fn new(backing: Box<dyn Row>, row_type: Arc<RowType>) -> Self {
        OverlayRow { backing, row_type }
    }
}

impl Row for OverlayRow {
    fn row_type(&self) -> &Arc<RowType> {
        &self.row_type
    }

    fn h_key(&self) -> &HKey {
        self.backing.h_key()
    }

    fn field(&self, i: usize) -> &Value {
        self.backing.field(i)
    }
}

// ── ProjectedRow ───────────────────────────────────────────────────────────

/// The post-image produced by a compiled projection.
///
/// Fields are evaluated when the row is constructed; the hKey is derived
/// from the new primary-key columns rather than inherited from the
/// pre-image.
#[derive(Debug, Clone)]
pub struct ProjectedRow {
    row_type: Arc<RowType>,
    hkey: HKey,
    fields: Vec<Value>,
}

impl ProjectedRow {
    pub fn new(row_type: Arc<RowType>, hkey: HKey, fields: Vec<Value>) -> Self {
        debug_assert_eq!(row_type.field_count(), fields.len());
        ProjectedRow {
            row_type,
            hkey,
            fields,
        }
    }
}

impl Row for ProjectedRow {
    fn row_type(&self) -> &Arc<RowType> {
        &self.row_type
    }

    fn h_key(&self) -> &HKey {
        &self.hkey
    }

    fn field(&self, i: usize) -> &Value {
        &self.fields[i]
    }
}

// ── hKey derivation ────────────────────────────────────────────────────────

/// Derive the hKey for `fields` as a row of `table_id`.
///
/// Walks the ancestor chain root-first, recovering each ancestor's PK
/// values: the direct parent's from this table's join columns, and
/// higher ancestors' through the cascaded keys of the tables between.
/// A grouping whose intermediate tables do not carry their join columns
/// inside their own PK cannot cascade, which is an internal invariant
/// violation here because the schema manager rejects such groupings.
pub fn derive_hkey(
    schema: &Schema,
    table_id: TableId,
    fields: &[Value],
) -> Result<HKey, GroupShiftError> {
    let leaf = schema
        .table(table_id)
        .ok_or(GroupShiftError::TableNotFound(table_id))?;

    let mut pk_values: HashMap<TableId, Vec<Value>> = HashMap::new();
    pk_values.insert(table_id, leaf.pk.iter().map(|&p| fields[p].clone()).collect());

    let mut child = leaf;
    let mut child_is_leaf = true;
    while let Some(parent_id) = child.parent {
        let parent = schema
            .table(parent_id)
            .ok_or(GroupShiftError::TableNotFound(parent_id))?;
        let values: Vec<Value> = if child_is_leaf {
            child
                .parent_join
                .iter()
                .map(|&p| fields[p].clone())
                .collect()
        } else {
            let child_pk_values = &pk_values[&child.id];
            child
                .parent_join
                .iter()
                .map(|&join_pos| {
                    child
                        .pk
                        .iter()
                        .position(|&pk_pos| pk_pos == join_pos)
                        .map(|k| child_pk_values[k].clone())
                        .ok_or_else(|| {
                            GroupShiftError::Internal(format!(
                                "table {} does not cascade its join columns",
                                child.name
                            ))
                        })
                })
                .collect::<Result<_, _>>()?
        };
        pk_values.insert(parent_id, values);
        child = parent;
        child_is_leaf = false;
    }

    let mut key = HKey::empty();
    for tid in schema.ancestry(table_id) {
        let t = schema.table(tid).expect("ancestry tables resolve");
        key.push_segment(t.ordinal, &pk_values[&tid]);
    }
    Ok(key)
}
