//! Per-table transforms: the compiled migration plan for one table.
//!
//! The transform cache is built lazily once per (old, new) schema pair
//! and memoized in the new schema's cache slot, so every scanner and
//! writer thread of an online session shares one immutable plan.
//!
//! For each table the plan records the change level, the target row
//! type, a compiled projection (only when the row shape actually
//! changes), a row checker (only for NOT NULL tightening), and the
//! indexes to maintain under both the scan and the writer paths.

use std::collections::HashMap;
use std::sync::Arc;

use crate::changeset::{ChangeKind, ChangeLevel, ChangeSet};
use crate::error::GroupShiftError;
use crate::expr::{EvalError, QueryContext, ScalarExpr};
use crate::row::{OverlayRow, ProjectedRow, Row, derive_hkey};
use crate::schema::{
    Column, ColumnDefault, IndexId, IndexKind, RowType, Schema, Table, TableId,
};
use crate::types::TypesRegistry;

// ── Projection ─────────────────────────────────────────────────────────────

/// A new-schema row type plus one scalar expression per new column.
#[derive(Debug, Clone)]
pub struct Projection {
    pub row_type: Arc<RowType>,
    pub exprs: Vec<ScalarExpr>,
}

// ── Row checker ────────────────────────────────────────────────────────────

/// Verifies NOT NULL and domain constraints against the new table.
#[derive(Debug, Clone)]
pub struct RowChecker {
    table: TableId,
    columns: Vec<CheckedColumn>,
}

#[derive(Debug, Clone)]
struct CheckedColumn {
    position: usize,
    name: String,
    class: crate::types::TypeClass,
    nullable: bool,
}

impl RowChecker {
    pub fn new(table: &Table) -> Self {
        RowChecker {
            table: table.id,
            columns: table
                .columns
                .iter()
                .enumerate()
                .map(|(position, c)| CheckedColumn {
                    position,
                    name: c.name.clone(),
                    class: c.class,
                    nullable: c.nullable,
                })
                .collect(),
        }
    }

    /// Check one row. The error carries the row's identity so the caller
    /// can surface which row broke the constraint.
    pub fn check(&self, row: &dyn Row) -> Result<(), GroupShiftError> {
        for col in &self.columns {
            let v = row.field(col.position);
            if v.is_null() {
                if !col.nullable {
                    return Err(GroupShiftError::NotNullViolation {
                        table: self.table,
                        column: col.name.clone(),
                        hkey: row.h_key().to_string(),
                    });
                }
                continue;
            }
            if v.type_class() != Some(col.class) {
                return Err(GroupShiftError::DomainViolation {
                    table: self.table,
                    column: col.name.clone(),
                    detail: format!("expected {}, got {v:?}", col.class.name()),
                });
            }
        }
        Ok(())
    }
}

// ── TableTransform ─────────────────────────────────────────────────────────

/// Immutable per-table migration record.
///
/// `table_id` doubles as the hKey-saver handle: both the scanner's
/// checkers and the writer's saves key the tracker with it.
#[derive(Debug)]
pub struct TableTransform {
    pub level: ChangeLevel,
    pub table_id: TableId,
    pub new_row_type: Arc<RowType>,
    /// Present iff the level is TABLE/GROUP and the row shape changed.
    pub projection: Option<Projection>,
    /// Present iff the level is METADATA_NOT_NULL.
    pub checker: Option<RowChecker>,
    /// Table indexes this session must maintain on this table.
    pub table_indexes: Vec<IndexId>,
    /// Group indexes owned by this table (leaf-most participant only).
    pub group_indexes: Vec<IndexId>,
}

impl TableTransform {
    fn build(
        cs: &ChangeSet,
        old_schema: &Schema,
        new_schema: &Schema,
        registry: &TypesRegistry,
        level: ChangeLevel,
    ) -> Result<Self, GroupShiftError> {
        let new_table = new_schema
            .table(cs.table_id)
            .ok_or(GroupShiftError::TableNotFound(cs.table_id))?;

        let mut checker = None;
        let mut projection = None;

        match level {
            ChangeLevel::MetadataNotNull => {
                checker = Some(RowChecker::new(new_table));
            }
            ChangeLevel::Index => {}
            ChangeLevel::Table | ChangeLevel::Group => {
                // The old table is fetched by the *new* table's id; the
                // id survives the change even when the name does not.
                let old_table = old_schema
                    .table(new_table.id)
                    .ok_or(GroupShiftError::TableNotFound(new_table.id))?;
                let shape_changed = !cs.column_changes.is_empty()
                    || old_table.column_count() != new_table.column_count();
                if shape_changed {
                    projection = Some(compile_projection(
                        cs, old_table, new_table, registry,
                    )?);
                }
            }
        }

        let (table_indexes, group_indexes) =
            collect_index_targets(cs, new_table, new_schema)?;

        Ok(TableTransform {
            level,
            table_id: cs.table_id,
            new_row_type: new_table.row_type.clone(),
            projection,
            checker,
            table_indexes,
            group_indexes,
        })
    }
}

/// Table-index and group-index build targets for one table's change-set.
///
/// A group index is claimed only by the leaf-most participating table,
/// so a session spanning every table of the group still builds it once.
fn collect_index_targets(
    cs: &ChangeSet,
    new_table: &Table,
    new_schema: &Schema,
) -> Result<(Vec<IndexId>, Vec<IndexId>), GroupShiftError> {
    let mut table_indexes = Vec::new();
    let mut group_indexes = Vec::new();
    for ic in &cs.index_changes {
        if !matches!(ic.kind, ChangeKind::Add | ChangeKind::Modify) {
            continue;
        }
        let name = ic
            .new_name
            .as_deref()
            .ok_or_else(|| GroupShiftError::Internal("index change without new name".into()))?;
        let index = new_schema
            .index_by_name(name)
            .filter(|ix| ix.kind == ic.category)
            .ok_or_else(|| GroupShiftError::IndexNotFound(name.to_string()))?;
        match index.kind {
            IndexKind::Table | IndexKind::FullText => table_indexes.push(index.id),
            IndexKind::Group => {
                if index.leafmost_table == new_table.id {
                    group_indexes.push(index.id);
                }
            }
        }
    }
    Ok((table_indexes, group_indexes))
}

// ── Projection compilation ─────────────────────────────────────────────────

fn compile_projection(
    cs: &ChangeSet,
    old_table: &Table,
    new_table: &Table,
    registry: &TypesRegistry,
) -> Result<Projection, GroupShiftError> {
    let mut exprs = Vec::with_capacity(new_table.columns.len());
    for (position, col) in new_table.columns.iter().enumerate() {
        let old_position = find_old_position(cs, old_table, new_table, position)?;
        let expr = match old_position {
            None => default_expression(col, registry)?,
            Some(old_pos) => {
                let field = ScalarExpr::Field(old_pos);
                let old_class = old_table.columns[old_pos].class;
                if old_class == col.class {
                    field
                } else {
                    // Nullability differences do not need a cast; a type
                    // class difference does, and an unresolvable one is
                    // a fatal schema incompatibility.
                    let func = registry.resolve_cast(old_class, col.class).ok_or(
                        GroupShiftError::CastNotFound {
                            from: old_class.name(),
                            to: col.class.name(),
                        },
                    )?;
                    ScalarExpr::Cast {
                        expr: Box::new(field),
                        to: col.class,
                        func,
                    }
                }
            }
        };
        exprs.push(expr);
    }
    Ok(Projection {
        row_type: new_table.row_type.clone(),
        exprs,
    })
}

/// Resolve a new column's position in the old table, or `None` when the
/// column is genuinely new and needs a default expression.
fn find_old_position(
    cs: &ChangeSet,
    old_table: &Table,
    new_table: &Table,
    new_position: usize,
) -> Result<Option<usize>, GroupShiftError> {
    let name = &new_table.columns[new_position].name;

    if let Some(change) = cs
        .column_changes
        .iter()
        .find(|c| c.new_name.as_deref() == Some(name))
    {
        return match change.kind {
            ChangeKind::Add => Ok(None),
            ChangeKind::Modify => {
                let old_name = change.old_name.as_deref().ok_or_else(|| {
                    GroupShiftError::Internal("MODIFY change without old name".into())
                })?;
                old_table
                    .column_position(old_name)
                    .map(Some)
                    .ok_or_else(|| GroupShiftError::ColumnNotFound {
                        table: old_table.id,
                        column: old_name.to_string(),
                    })
            }
            ChangeKind::Drop => Err(GroupShiftError::ProjectionColumnMissing(name.clone())),
        };
    }

    match old_table.column_position(name) {
        Some(pos) => Ok(Some(pos)),
        None => {
            let is_hidden_pk =
                new_table.hidden_pk && new_position == new_table.columns.len() - 1;
            if is_hidden_pk {
                Ok(None)
            } else {
                Err(GroupShiftError::ColumnNotFound {
                    table: old_table.id,
                    column: name.clone(),
                })
            }
        }
    }
}

/// Synthesize the expression for a new column with no old-side source.
fn default_expression(
    col: &Column,
    registry: &TypesRegistry,
) -> Result<ScalarExpr, GroupShiftError> {
    match &col.default {
        ColumnDefault::Identity(seq) => Ok(ScalarExpr::SequenceNext(*seq)),
        ColumnDefault::Function(name) => {
            let op = registry
                .resolve_scalar(name)
                .ok_or_else(|| GroupShiftError::FunctionNotFound(name.clone()))?;
            let call = ScalarExpr::Call(op);
            if op.result_type() == col.class {
                Ok(call)
            } else {
                let func = registry
                    .resolve_cast(op.result_type(), col.class)
                    .ok_or(GroupShiftError::CastNotFound {
                        from: op.result_type().name(),
                        to: col.class.name(),
                    })?;
                Ok(ScalarExpr::Cast {
                    expr: Box::new(call),
                    to: col.class,
                    func,
                })
            }
        }
        ColumnDefault::Literal(s) => {
            let v = col
                .class
                .parse_literal(s)
                .map_err(|_| GroupShiftError::BadDefaultLiteral {
                    literal: s.clone(),
                    ty: col.class.name(),
                })?;
            Ok(ScalarExpr::Literal(v))
        }
        ColumnDefault::None => Ok(ScalarExpr::NullLiteral(col.class)),
    }
}

// ── Row transformation ─────────────────────────────────────────────────────

/// Transform an old-schema row into the new schema.
///
/// Without a projection the result is an overlay that keeps the
/// pre-image's hKey identity. With one, every expression is evaluated
/// (sequences advance through the context), NOT NULL and domain
/// constraints are checked, and the hKey is derived from the new
/// primary-key columns.
pub fn transform_row(
    ctx: &QueryContext,
    new_schema: &Schema,
    transform: &TableTransform,
    old_row: Box<dyn Row>,
) -> Result<Box<dyn Row>, GroupShiftError> {
    let Some(projection) = &transform.projection else {
        return Ok(Box::new(OverlayRow::new(
            old_row,
            transform.new_row_type.clone(),
        )));
    };

    let new_table = new_schema
        .table(transform.table_id)
        .ok_or(GroupShiftError::TableNotFound(transform.table_id))?;

    let mut fields = Vec::with_capacity(projection.exprs.len());
    for (position, expr) in projection.exprs.iter().enumerate() {
        let value = expr.eval(&*old_row, ctx).map_err(|e| match e {
            EvalError::Domain(detail) => GroupShiftError::DomainViolation {
                table: transform.table_id,
                column: new_table.columns[position].name.clone(),
                detail,
            },
            EvalError::Engine(err) => err,
        })?;
        fields.push(value);
    }

    let hkey = derive_hkey(new_schema, transform.table_id, &fields)?;

    for (position, col) in new_table.columns.iter().enumerate() {
        if !col.nullable && fields[position].is_null() {
            return Err(GroupShiftError::NotNullViolation {
                table: transform.table_id,
                column: col.name.clone(),
                hkey: hkey.to_string(),
            });
        }
    }

    Ok(Box::new(ProjectedRow::new(
        projection.row_type.clone(),
        hkey,
        fields,
    )))
}

// ── TransformCache ─────────────────────────────────────────────────────────

/// The per-session mapping tableId → [`TableTransform`].
#[derive(Debug)]
pub struct TransformCache {
    old_generation: u64,
    new_generation: u64,
    transforms: HashMap<TableId, TableTransform>,
}

impl TransformCache {
    /// Build the cache for one session's change-sets. `level` is the
    /// already-classified common level.
    pub fn build(
        change_sets: &[ChangeSet],
        old_schema: &Schema,
        new_schema: &Schema,
        registry: &TypesRegistry,
        level: ChangeLevel,
    ) -> Result<Self, GroupShiftError> {
        let mut transforms = HashMap::with_capacity(change_sets.len());
        for cs in change_sets {
            let t = TableTransform::build(cs, old_schema, new_schema, registry, level)?;
            transforms.insert(cs.table_id, t);
        }
        Ok(TransformCache {
            old_generation: old_schema.generation,
            new_generation: new_schema.generation,
            transforms,
        })
    }

    /// Fetch the memoized cache from the new schema's cache slot,
    /// building it on first read.
    pub fn cached(
        change_sets: &[ChangeSet],
        old_schema: &Schema,
        new_schema: &Schema,
        registry: &TypesRegistry,
        level: ChangeLevel,
    ) -> Result<Arc<Self>, GroupShiftError> {
        let cache = new_schema.cached(|| {
            Self::build(change_sets, old_schema, new_schema, registry, level).map(Arc::new)
        })?;
        debug_assert_eq!(cache.old_generation, old_schema.generation);
        debug_assert_eq!(cache.new_generation, new_schema.generation);
        Ok(cache)
    }

    pub fn for_table(&self, id: TableId) -> Option<&TableTransform> {
        self.transforms.get(&id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableTransform> {
        self.transforms.values()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}
