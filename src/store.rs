//! Collaborator seams: session, schema manager, transaction service,
//! store adapter, group cursor, and the row-listener registration
//! surface.
//!
//! The engine owns none of these. The SQL server wires its own
//! implementations in; the crate ships a reference in-memory set
//! (`mem`) with the visibility semantics the engine requires, used by
//! the integration tests.

use std::sync::Arc;

use crate::changeset::ChangeSet;
use crate::error::GroupShiftError;
use crate::expr::SequenceService;
use crate::hkey::HKey;
use crate::row::Row;
use crate::schema::{GroupId, Index, Schema, TableId};

/// A server session. One online schema change session maps to one of
/// these on the background side; writer threads carry their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session {
    pub id: u64,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Session { id }
    }
}

// ── Schema manager ─────────────────────────────────────────────────────────

/// The logical schema manager: owner of the online session state (the
/// change-sets, the target schema, and the per-table handled-hKey sets).
pub trait SchemaManager: Send + Sync {
    /// The change-sets of the active online session.
    fn online_change_sets(&self, session: &Session) -> Result<Vec<ChangeSet>, GroupShiftError>;

    /// The target (post-change) schema of the active online session.
    fn online_schema(&self, session: &Session) -> Result<Arc<Schema>, GroupShiftError>;

    /// The current (pre-change) schema.
    fn current_schema(&self, session: &Session) -> Result<Arc<Schema>, GroupShiftError>;

    /// Whether `table` is under online change in this session.
    fn is_online_active(&self, session: &Session, table: TableId) -> bool;

    /// Record a writer-handled hKey. Idempotent (set semantics).
    fn add_online_handled_hkey(&self, session: &Session, table: TableId, hkey: &HKey);

    /// Materialize the ascending handled-hKey sequence `>= start`, as of
    /// the caller's transaction snapshot.
    fn online_handled_hkeys(
        &self,
        session: &Session,
        table: TableId,
        start: Option<&HKey>,
    ) -> Vec<HKey>;
}

// ── Transaction service ────────────────────────────────────────────────────

/// The transaction manager surface the engine consumes.
pub trait TransactionService: Send + Sync {
    fn begin(&self, session: &Session) -> Result<(), GroupShiftError>;

    fn commit(&self, session: &Session) -> Result<(), GroupShiftError>;

    /// Roll back the session's transaction if one is open.
    fn rollback_if_open(&self, session: &Session);

    /// Commit the current batch if the service decides it is time.
    /// Returns true when a commit was taken at this call; the caller
    /// then begins a fresh transaction.
    fn periodically_commit(&self, session: &Session) -> Result<bool, GroupShiftError>;

    /// Commit, returning true when the caller must retry in a fresh
    /// transaction.
    fn commit_or_retry(&self, session: &Session) -> Result<bool, GroupShiftError>;
}

// ── Store ──────────────────────────────────────────────────────────────────

/// Bulk group-index maintenance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupIndexAction {
    Store,
    Remove,
}

/// A group scan over one schema space, optionally filtered to a set of
/// row types (tables).
#[derive(Debug, Clone)]
pub struct GroupScanPlan {
    pub group: GroupId,
    pub tables: Option<std::collections::BTreeSet<TableId>>,
}

impl GroupScanPlan {
    pub fn full(group: GroupId) -> Self {
        GroupScanPlan {
            group,
            tables: None,
        }
    }

    pub fn filtered(group: GroupId, tables: impl IntoIterator<Item = TableId>) -> Self {
        GroupScanPlan {
            group,
            tables: Some(tables.into_iter().collect()),
        }
    }

    pub fn accepts(&self, table: TableId) -> bool {
        self.tables.as_ref().is_none_or(|set| set.contains(&table))
    }
}

/// The ordered key/value store.
pub trait Store: Send + Sync {
    /// Create an adapter bound to `schema`'s row space for `session`'s
    /// transaction.
    fn adapter(&self, session: &Session, schema: Arc<Schema>) -> Box<dyn StoreAdapter>;
}

/// Row and index mutation surface over one schema space.
///
/// All mutations join the session's open transaction. Index arguments
/// are passed by definition, not by id: during an online session the
/// adapter bound to the old row space routinely maintains an index that
/// only the new schema defines.
pub trait StoreAdapter: Send {
    fn schema(&self) -> &Arc<Schema>;

    /// Write a row and maintain the given indexes for it.
    fn write_row(
        &self,
        row: &dyn Row,
        table_indexes: &[&Index],
        group_indexes: &[&Index],
    ) -> Result<(), GroupShiftError>;

    /// Logically delete a row. `NoSuchRow` when it is absent.
    fn delete_row(&self, row: &dyn Row, cascade: bool) -> Result<(), GroupShiftError>;

    /// Write one table-index entry for a row.
    fn write_index_row(
        &self,
        index: &Index,
        row: &dyn Row,
        hkey: &HKey,
    ) -> Result<(), GroupShiftError>;

    /// Remove one table-index entry for a row.
    fn delete_index_row(
        &self,
        index: &Index,
        row: &dyn Row,
        hkey: &HKey,
    ) -> Result<(), GroupShiftError>;

    /// Per-row group-index maintenance entry point.
    fn group_index_row(
        &self,
        index: &Index,
        row: &dyn Row,
        hkey: &HKey,
        action: GroupIndexAction,
    ) -> Result<(), GroupShiftError>;

    /// Bulk group-index maintenance: visit every current row of the
    /// index's group and apply `action`.
    fn run_group_index_plan(
        &self,
        index: &Index,
        action: GroupIndexAction,
    ) -> Result<(), GroupShiftError>;

    /// Open a cursor over a group scan plan.
    fn group_cursor(&self, plan: &GroupScanPlan) -> Result<Box<dyn GroupCursor>, GroupShiftError>;

    /// The store's sequence service (identity generators).
    fn sequences(&self) -> Arc<dyn SequenceService>;
}

/// Cursor over a group scan. Rows come back in strictly ascending hKey
/// order. The leaf operator is rebindable: after a rollback the driver
/// repositions it just past the last committed watermark.
pub trait GroupCursor: Send {
    /// (Re)open the cursor under the session's current transaction.
    fn open(&mut self) -> Result<(), GroupShiftError>;

    fn next(&mut self) -> Result<Option<Box<dyn Row>>, GroupShiftError>;

    /// Position the cursor so the next row is strictly greater than
    /// `after` (or at the start when `None`).
    fn rebind(&mut self, after: Option<&HKey>);

    fn close(&mut self);
}

// ── Row listener ───────────────────────────────────────────────────────────

/// Per-row DML listener the store fires on every mutation.
///
/// For a logical update, `on_update_pre` delivers the old image during
/// the delete phase and `on_update_post` the new image during the write
/// phase; both fire within the writer's transaction, in program order.
pub trait RowListener: Send + Sync {
    fn on_insert_post(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        row: &dyn Row,
    ) -> Result<(), GroupShiftError>;

    fn on_update_pre(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        old_row: &dyn Row,
    ) -> Result<(), GroupShiftError>;

    fn on_update_post(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        new_row: &dyn Row,
    ) -> Result<(), GroupShiftError>;

    fn on_delete_pre(
        &self,
        session: &Session,
        table: TableId,
        hkey: &HKey,
        row: &dyn Row,
    ) -> Result<(), GroupShiftError>;
}
