//! Concurrent DML hook.
//!
//! Registered with the store as a per-row listener. While a table is
//! under online change, every writer-side mutation is mirrored into the
//! new schema so the migration misses nothing the scanner has not
//! reached yet: index entries at INDEX level, constraint checks at
//! METADATA_NOT_NULL level, and a full project-delete-write at
//! TABLE/GROUP level.
//!
//! Two guards keep the hook quiet when it must be:
//! - a table that is not online-active returns immediately, and
//! - a row that already reports the post-transform row type is one of
//!   the engine's own writes; processing it again would double-maintain.
//!
//! Every firing ends by recording the row's hKey in the tracker. That
//! record is the token the scanner sees and skips.

use std::sync::Arc;

use tracing::warn;

use crate::changeset::{ChangeLevel, classify};
use crate::config::EngineConfig;
use crate::error::GroupShiftError;
use crate::expr::QueryContext;
use crate::hkey::HKey;
use crate::row::{BoundRow, Row};
use crate::schema::{Index, Schema, TableId};
use crate::store::{GroupIndexAction, RowListener, SchemaManager, Session, Store};
use crate::transform::{TableTransform, TransformCache, transform_row};
use crate::types::TypesRegistry;

/// Which half of a mutation a callback carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Pre-image going away (delete, or the delete phase of an update).
    Delete,
    /// Post-image arriving (insert, or the write phase of an update).
    Write,
}

/// The per-row listener maintaining the new schema under live DML.
pub struct OnlineHook {
    manager: Arc<dyn SchemaManager>,
    store: Arc<dyn Store>,
    registry: TypesRegistry,
    config: EngineConfig,
}

impl OnlineHook {
    pub fn new(
        manager: Arc<dyn SchemaManager>,
        store: Arc<dyn Store>,
        registry: TypesRegistry,
        config: EngineConfig,
    ) -> Self {
        OnlineHook {
            manager,
            store,
            registry,
            config,
        }
    }

    fn fire(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        row: &dyn Row,
        phase: Phase,
    ) -> Result<(), GroupShiftError> {
        if !self.manager.is_online_active(session, table) {
            return Ok(());
        }

        let change_sets = self.manager.online_change_sets(session)?;
        let level = classify(&change_sets)?;
        let old_schema = self.manager.current_schema(session)?;
        let new_schema = self.manager.online_schema(session)?;
        let cache = TransformCache::cached(
            &change_sets,
            &old_schema,
            &new_schema,
            &self.registry,
            level,
        )?;
        let Some(transform) = cache.for_table(table) else {
            return Ok(());
        };

        // The engine's own writes come back through the store with the
        // post-transform row type; maintaining them again would double
        // the work the firing already did.
        if Arc::ptr_eq(row.row_type(), &transform.new_row_type) {
            return Ok(());
        }

        if !self.config.allow_concurrent_dml {
            return Err(GroupShiftError::ConcurrentDmlNotAllowed);
        }

        match transform.level {
            ChangeLevel::MetadataNotNull => {
                if phase == Phase::Write
                    && let Some(checker) = &transform.checker
                {
                    checker.check(row)?;
                }
            }
            ChangeLevel::Index => {
                self.maintain_indexes(session, &old_schema, &new_schema, transform, row, hkey, phase)?;
            }
            ChangeLevel::Table | ChangeLevel::Group => {
                self.promote_row(session, &new_schema, transform, row, hkey, phase)?;
            }
        }

        self.manager.add_online_handled_hkey(session, table, hkey);
        Ok(())
    }

    /// INDEX level: mirror the mutation into every index under build.
    #[allow(clippy::too_many_arguments)]
    fn maintain_indexes(
        &self,
        session: &Session,
        old_schema: &Arc<Schema>,
        new_schema: &Arc<Schema>,
        transform: &TableTransform,
        row: &dyn Row,
        hkey: &HKey,
        phase: Phase,
    ) -> Result<(), GroupShiftError> {
        // Rows are not rewritten at INDEX level, so maintenance runs in
        // the current row space; the index definitions come from the new
        // schema.
        let adapter = self.store.adapter(session, old_schema.clone());
        for id in &transform.table_indexes {
            let index = resolve_index(new_schema, *id)?;
            match phase {
                Phase::Delete => adapter.delete_index_row(index, row, hkey)?,
                Phase::Write => adapter.write_index_row(index, row, hkey)?,
            }
        }
        for id in &transform.group_indexes {
            let index = resolve_index(new_schema, *id)?;
            let action = match phase {
                Phase::Delete => GroupIndexAction::Remove,
                Phase::Write => GroupIndexAction::Store,
            };
            adapter.group_index_row(index, row, hkey, action)?;
        }
        Ok(())
    }

    /// TABLE/GROUP level: project the image into the new schema and
    /// replay the mutation there.
    fn promote_row(
        &self,
        session: &Session,
        new_schema: &Arc<Schema>,
        transform: &TableTransform,
        row: &dyn Row,
        hkey: &HKey,
        phase: Phase,
    ) -> Result<(), GroupShiftError> {
        let adapter = self.store.adapter(session, new_schema.clone());
        let ctx = QueryContext::new(adapter.sequences());

        // Old-schema row view over the image payload.
        let view = BoundRow::new(row.row_type().clone(), hkey.clone(), row.fields());
        let projected = transform_row(&ctx, new_schema, transform, Box::new(view))?;

        match phase {
            Phase::Delete => {
                match adapter.delete_row(&*projected, false) {
                    // The scanner has not promoted this row into the new
                    // space yet; there is nothing to delete.
                    Err(e @ GroupShiftError::NoSuchRow(_)) => {
                        warn!(session = session.id, error = %e, "pre-image not yet promoted");
                    }
                    other => other?,
                }
            }
            Phase::Write => {
                let table_indexes = resolve_indexes(new_schema, &transform.table_indexes)?;
                let group_indexes = resolve_indexes(new_schema, &transform.group_indexes)?;
                adapter.write_row(
                    &*projected,
                    &table_indexes.iter().collect::<Vec<_>>(),
                    &group_indexes.iter().collect::<Vec<_>>(),
                )?;
            }
        }
        Ok(())
    }
}

fn resolve_index(schema: &Schema, id: crate::schema::IndexId) -> Result<&Index, GroupShiftError> {
    schema
        .index(id)
        .ok_or_else(|| GroupShiftError::IndexNotFound(format!("{id:?}")))
}

fn resolve_indexes(
    schema: &Schema,
    ids: &[crate::schema::IndexId],
) -> Result<Vec<Index>, GroupShiftError> {
    ids.iter()
        .map(|id| resolve_index(schema, *id).cloned())
        .collect()
}

impl RowListener for OnlineHook {
    fn on_insert_post(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        row: &dyn Row,
    ) -> Result<(), GroupShiftError> {
        self.fire(session, table, hkey, row, Phase::Write)
    }

    fn on_update_pre(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        old_row: &dyn Row,
    ) -> Result<(), GroupShiftError> {
        self.fire(session, table, hkey, old_row, Phase::Delete)
    }

    fn on_update_post(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        new_row: &dyn Row,
    ) -> Result<(), GroupShiftError> {
        self.fire(session, table, hkey, new_row, Phase::Write)
    }

    fn on_delete_pre(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        row: &dyn Row,
    ) -> Result<(), GroupShiftError> {
        self.fire(session, table, hkey, row, Phase::Delete)
    }
}
