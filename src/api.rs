//! Public operations of the online schema change engine.
//!
//! The DDL controller publishes a change-set and a new schema through
//! the schema manager, classifies the session, and calls the operation
//! matching the level:
//!
//! - [`OnlineEngine::build_indexes`] — INDEX level
//! - [`OnlineEngine::check_table_constraints`] — METADATA_NOT_NULL level
//! - [`OnlineEngine::alter_table`] — TABLE / GROUP level
//!
//! Each either completes, leaving the new schema fully populated, or
//! fails and leaves the online session in a state the schema manager
//! can abandon. No partial observable schema change escapes.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::changeset::{ChangeLevel, ChangeSet, classify, find_indexes_to_build};
use crate::config::EngineConfig;
use crate::error::GroupShiftError;
use crate::expr::QueryContext;
use crate::hook::OnlineHook;
use crate::row::{OverlayRow, Row};
use crate::scan::{ScanDriver, ScanStats};
use crate::schema::{GroupId, Index, IndexKind, Schema, TableId};
use crate::store::{
    GroupIndexAction, GroupScanPlan, SchemaManager, Session, Store, StoreAdapter,
    TransactionService,
};
use crate::transform::{TransformCache, transform_row};
use crate::types::TypesRegistry;

/// The engine: collaborator handles plus configuration.
pub struct OnlineEngine {
    manager: Arc<dyn SchemaManager>,
    txn: Arc<dyn TransactionService>,
    store: Arc<dyn Store>,
    registry: TypesRegistry,
    config: EngineConfig,
}

/// Everything one operation needs, loaded once per call.
struct SessionPlan {
    change_sets: Vec<ChangeSet>,
    level: ChangeLevel,
    old_schema: Arc<Schema>,
    new_schema: Arc<Schema>,
    cache: Arc<TransformCache>,
}

impl OnlineEngine {
    pub fn new(
        manager: Arc<dyn SchemaManager>,
        txn: Arc<dyn TransactionService>,
        store: Arc<dyn Store>,
        registry: TypesRegistry,
        config: EngineConfig,
    ) -> Self {
        OnlineEngine {
            manager,
            txn,
            store,
            registry,
            config,
        }
    }

    /// The row listener the embedding server registers with the store
    /// for the lifetime of the online session.
    pub fn hook(&self) -> OnlineHook {
        OnlineHook::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.store),
            self.registry,
            self.config.clone(),
        )
    }

    fn load(&self, session: &Session) -> Result<Option<SessionPlan>, GroupShiftError> {
        let change_sets = self.manager.online_change_sets(session)?;
        if change_sets.is_empty() {
            // An empty session is a no-op, not an error: there is
            // nothing to migrate and nothing to fail.
            return Ok(None);
        }
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
        Ok(Some(SessionPlan {
            change_sets,
            level,
            old_schema,
            new_schema,
            cache,
        }))
    }

    /// Affected tables per old-schema group.
    fn groups_of(
        plan: &SessionPlan,
    ) -> Result<BTreeMap<GroupId, Vec<TableId>>, GroupShiftError> {
        let mut groups: BTreeMap<GroupId, Vec<TableId>> = BTreeMap::new();
        for cs in &plan.change_sets {
            let table = plan
                .old_schema
                .table(cs.table_id)
                .ok_or(GroupShiftError::TableNotFound(cs.table_id))?;
            groups.entry(table.group).or_default().push(cs.table_id);
        }
        Ok(groups)
    }

    fn driver<'a>(&'a self, session: &'a Session) -> ScanDriver<'a> {
        ScanDriver::new(
            session,
            &*self.txn,
            &*self.manager,
            self.config.commit_retry,
        )
    }

    // ── buildIndexes ──────────────────────────────────────────────────

    /// Populate the indexes an INDEX-level session adds.
    ///
    /// For each affected group, a filtered scan writes every required
    /// table-index entry; group indexes then get a bulk maintenance plan
    /// with a store action.
    pub fn build_indexes(
        &self,
        session: &Session,
        _ctx: Option<QueryContext>,
    ) -> Result<ScanStats, GroupShiftError> {
        let Some(plan) = self.load(session)? else {
            return Ok(ScanStats::default());
        };
        if plan.level != ChangeLevel::Index {
            return Err(GroupShiftError::Internal(format!(
                "buildIndexes requires INDEX level, got {}",
                plan.level.as_str()
            )));
        }

        let result = self.build_indexes_inner(session, &plan);
        if result.is_err() {
            self.txn.rollback_if_open(session);
        }
        result
    }

    fn build_indexes_inner(
        &self,
        session: &Session,
        plan: &SessionPlan,
    ) -> Result<ScanStats, GroupShiftError> {
        // Rows are not rewritten at INDEX level: scans and index entries
        // both live in the current row space.
        let adapter = self.store.adapter(session, plan.old_schema.clone());
        let mut total = ScanStats::default();

        for (group, tables) in Self::groups_of(plan)? {
            let scan_plan = GroupScanPlan::filtered(group, tables.iter().copied());
            let mut cursor = adapter.group_cursor(&scan_plan)?;
            self.txn.begin(session)?;
            let stats = self.driver(session).run_plan(&mut *cursor, &mut |row| {
                self.write_table_index_entries(&*adapter, plan, row)
            })?;
            total = merge(total, stats);
        }

        // Group indexes get one bulk pass each.
        let group_indexes: Vec<&Index> = find_indexes_to_build(&plan.change_sets, &plan.new_schema)?
            .into_iter()
            .filter_map(|id| plan.new_schema.index(id))
            .filter(|ix| ix.kind == IndexKind::Group)
            .collect();
        if !group_indexes.is_empty() {
            self.txn.begin(session)?;
            for index in group_indexes {
                adapter.run_group_index_plan(index, GroupIndexAction::Store)?;
            }
            self.txn.commit(session)?;
        }

        info!(session = session.id, "index build complete");
        Ok(total)
    }

    fn write_table_index_entries(
        &self,
        adapter: &dyn StoreAdapter,
        plan: &SessionPlan,
        row: &dyn Row,
    ) -> Result<(), GroupShiftError> {
        let Some(table) = row.row_type().table else {
            return Ok(());
        };
        let Some(transform) = plan.cache.for_table(table) else {
            return Ok(());
        };
        for id in &transform.table_indexes {
            let index = plan
                .new_schema
                .index(*id)
                .ok_or_else(|| GroupShiftError::IndexNotFound(format!("{id:?}")))?;
            adapter.write_index_row(index, row, row.h_key())?;
        }
        Ok(())
    }

    // ── checkTableConstraints ─────────────────────────────────────────

    /// Verify every existing row against a METADATA_NOT_NULL session's
    /// tightened constraints. Mutates nothing.
    pub fn check_table_constraints(
        &self,
        session: &Session,
        _ctx: Option<QueryContext>,
    ) -> Result<ScanStats, GroupShiftError> {
        let Some(plan) = self.load(session)? else {
            return Ok(ScanStats::default());
        };
        if plan.level != ChangeLevel::MetadataNotNull {
            return Err(GroupShiftError::Internal(format!(
                "checkTableConstraints requires METADATA_NOT_NULL level, got {}",
                plan.level.as_str()
            )));
        }

        let adapter = self.store.adapter(session, plan.old_schema.clone());
        let mut total = ScanStats::default();
        let result = (|| {
            for (group, tables) in Self::groups_of(&plan)? {
                let scan_plan = GroupScanPlan::filtered(group, tables.iter().copied());
                let mut cursor = adapter.group_cursor(&scan_plan)?;
                self.txn.begin(session)?;
                let stats = self.driver(session).run_plan(&mut *cursor, &mut |row| {
                    let Some(table) = row.row_type().table else {
                        return Ok(());
                    };
                    match plan.cache.for_table(table).and_then(|t| t.checker.as_ref()) {
                        Some(checker) => checker.check(row),
                        None => Ok(()),
                    }
                })?;
                total = merge(total, stats);
            }
            Ok(total)
        })();
        if result.is_err() {
            self.txn.rollback_if_open(session);
        }
        result
    }

    // ── alterTable ────────────────────────────────────────────────────

    /// Rewrite every row of the affected old groups into the new schema.
    ///
    /// The old-root set is the union, over the change-sets, of the root
    /// of the old table and the root of the old-side view of the new
    /// table id, covering both rename-across-group and in-place cases.
    /// Rows the concurrent-DML hook already promoted are skipped through
    /// the tracker.
    pub fn alter_table(
        &self,
        session: &Session,
        ctx: Option<QueryContext>,
    ) -> Result<ScanStats, GroupShiftError> {
        let Some(plan) = self.load(session)? else {
            return Ok(ScanStats::default());
        };
        if !matches!(plan.level, ChangeLevel::Table | ChangeLevel::Group) {
            return Err(GroupShiftError::Internal(format!(
                "alterTable requires TABLE or GROUP level, got {}",
                plan.level.as_str()
            )));
        }

        let result = self.alter_table_inner(session, &plan, ctx);
        if result.is_err() {
            self.txn.rollback_if_open(session);
        }
        result
    }

    fn alter_table_inner(
        &self,
        session: &Session,
        plan: &SessionPlan,
        ctx: Option<QueryContext>,
    ) -> Result<ScanStats, GroupShiftError> {
        let scan_adapter = self.store.adapter(session, plan.old_schema.clone());
        let write_adapter = self.store.adapter(session, plan.new_schema.clone());
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => QueryContext::new(write_adapter.sequences()),
        };

        // Old roots: the old table's root and the old-side root of the
        // new table's id. With stable table ids these coincide unless
        // the change moves the table across groups.
        let mut old_roots: std::collections::BTreeSet<TableId> = std::collections::BTreeSet::new();
        for cs in &plan.change_sets {
            if let Some(root) = plan.old_schema.root_of(cs.table_id) {
                old_roots.insert(root);
            }
            if let Some(new_table) = plan.new_schema.table(cs.table_id)
                && let Some(root) = plan.old_schema.root_of(new_table.id)
            {
                old_roots.insert(root);
            }
        }

        let mut total = ScanStats::default();
        for root in old_roots {
            let group = plan
                .old_schema
                .table(root)
                .map(|t| t.group)
                .ok_or(GroupShiftError::TableNotFound(root))?;
            let mut cursor = scan_adapter.group_cursor(&GroupScanPlan::full(group))?;
            self.txn.begin(session)?;
            let stats = self.driver(session).run_plan(&mut *cursor, &mut |row| {
                self.promote_scanned_row(&*write_adapter, plan, &ctx, row)
            })?;
            total = merge(total, stats);
        }

        info!(
            session = session.id,
            rows = total.rows_handled,
            skipped = total.rows_skipped,
            "table rewrite complete"
        );
        Ok(total)
    }

    /// Project one scanned old row into the new schema and write it with
    /// its indexes. Rows of tables outside the change-sets still move:
    /// the whole old group is rewritten, unchanged tables by overlay.
    fn promote_scanned_row(
        &self,
        write_adapter: &dyn StoreAdapter,
        plan: &SessionPlan,
        ctx: &QueryContext,
        row: &dyn Row,
    ) -> Result<(), GroupShiftError> {
        let Some(table) = row.row_type().table else {
            return Ok(());
        };

        let owned: Box<dyn Row> = Box::new(crate::row::BoundRow::new(
            row.row_type().clone(),
            row.h_key().clone(),
            row.fields(),
        ));

        match plan.cache.for_table(table) {
            Some(transform) => {
                let projected = transform_row(ctx, &plan.new_schema, transform, owned)?;
                let table_indexes = transform
                    .table_indexes
                    .iter()
                    .filter_map(|id| plan.new_schema.index(*id))
                    .collect::<Vec<_>>();
                let group_indexes = transform
                    .group_indexes
                    .iter()
                    .filter_map(|id| plan.new_schema.index(*id))
                    .collect::<Vec<_>>();
                write_adapter.write_row(&*projected, &table_indexes, &group_indexes)
            }
            None => {
                // A group member with no change-set of its own: carried
                // into the new space unchanged.
                let Some(new_table) = plan.new_schema.table(table) else {
                    // Dropped table: its rows do not survive the change.
                    return Ok(());
                };
                let overlay = OverlayRow::new(owned, new_table.row_type.clone());
                write_adapter.write_row(&overlay, &[], &[])
            }
        }
    }
}

fn merge(a: ScanStats, b: ScanStats) -> ScanStats {
    ScanStats {
        rows_handled: a.rows_handled + b.rows_handled,
        rows_skipped: a.rows_skipped + b.rows_skipped,
        commits: a.commits + b.commits,
        rebinds: a.rebinds + b.rebinds,
    }
}
