//! Reference in-memory backend: store, transaction service, schema
//! manager.
//!
//! A single-process implementation of the collaborator seams with the
//! visibility rules the engine depends on: cursors read committed state
//! only, mutations buffer in a per-session transaction until commit, and
//! a rolled-back transaction leaves no trace. Row spaces are keyed by
//! schema generation, so an online session's old and new row images
//! coexist until the migration completes.
//!
//! This backend exists so the scanner/writer race is exercisable in
//! plain integration tests; a production deployment plugs the real
//! ordered key/value store into the same traits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;

use crate::changeset::ChangeSet;
use crate::error::GroupShiftError;
use crate::expr::SequenceService;
use crate::hkey::{HKey, encode_value};
use crate::row::{BoundRow, Row, derive_hkey};
use crate::schema::{GroupId, Index, IndexId, Schema, SequenceId, TableId};
use crate::store::{
    GroupCursor, GroupIndexAction, GroupScanPlan, RowListener, Session, Store, StoreAdapter,
    TransactionService,
};
use crate::tracker::{HKeyTracker, MemoryHKeyTracker};
use crate::types::Value;

// ── Storage state ──────────────────────────────────────────────────────────

type SpaceKey = (u64, GroupId, HKey);

#[derive(Debug, Clone)]
struct StoredRow {
    table: TableId,
    values: Vec<Value>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    values: Vec<Value>,
    hkey: HKey,
}

#[derive(Debug)]
enum Op {
    PutRow {
        key: SpaceKey,
        row: StoredRow,
    },
    RemoveRow {
        key: SpaceKey,
    },
    PutIndex {
        index: IndexId,
        key: Vec<u8>,
        entry: IndexEntry,
    },
    RemoveIndex {
        index: IndexId,
        key: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct StoreState {
    rows: BTreeMap<SpaceKey, StoredRow>,
    indexes: BTreeMap<IndexId, BTreeMap<Vec<u8>, IndexEntry>>,
    txns: HashMap<u64, Vec<Op>>,
}

impl StoreState {
    /// Whether a row exists from this session's point of view: committed
    /// state overlaid with the session's own pending operations.
    fn row_visible(&self, session: u64, key: &SpaceKey) -> bool {
        if let Some(ops) = self.txns.get(&session) {
            for op in ops.iter().rev() {
                match op {
                    Op::PutRow { key: k, .. } if k == key => return true,
                    Op::RemoveRow { key: k } if k == key => return false,
                    _ => {}
                }
            }
        }
        self.rows.contains_key(key)
    }

    /// Find the ancestor row of `hkey` belonging to `table`, preferring
    /// the given generation's space but falling back to any space with
    /// the same group (a TABLE-level rewrite keeps parents in the old
    /// space until the scanner promotes them).
    fn find_ancestor(
        &self,
        prefer_gen: u64,
        group: GroupId,
        table: TableId,
        hkey: &HKey,
    ) -> Option<&StoredRow> {
        let mut fallback = None;
        for ((gen_, g, k), row) in &self.rows {
            if *g != group || row.table != table || !k.is_prefix_of(hkey) {
                continue;
            }
            if *gen_ == prefer_gen {
                return Some(row);
            }
            fallback = Some(row);
        }
        fallback
    }

    fn apply(&mut self, ops: Vec<Op>) {
        for op in ops {
            match op {
                Op::PutRow { key, row } => {
                    self.rows.insert(key, row);
                }
                Op::RemoveRow { key } => {
                    self.rows.remove(&key);
                }
                Op::PutIndex { index, key, entry } => {
                    self.indexes.entry(index).or_default().insert(key, entry);
                }
                Op::RemoveIndex { index, key } => {
                    if let Some(map) = self.indexes.get_mut(&index) {
                        map.remove(&key);
                    }
                }
            }
        }
    }
}

// ── MemoryStore ────────────────────────────────────────────────────────────

/// The in-memory ordered store.
pub struct MemoryStore {
    inner: Mutex<StoreState>,
    listeners: RwLock<Vec<Arc<dyn RowListener>>>,
    sequences: DashMap<SequenceId, i64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(StoreState::default()),
            listeners: RwLock::new(Vec::new()),
            sequences: DashMap::new(),
        }
    }

    /// Register a per-row DML listener (the concurrent-DML hook).
    pub fn register_listener(&self, listener: Arc<dyn RowListener>) {
        self.listeners.write().expect("listener lock").push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn RowListener>> {
        self.listeners.read().expect("listener lock").clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.lock().expect("store lock poisoned")
    }

    // ── Transactions ──────────────────────────────────────────────────

    pub fn begin(&self, session: &Session) {
        self.lock().txns.insert(session.id, Vec::new());
    }

    pub fn commit(&self, session: &Session) -> Result<(), GroupShiftError> {
        let mut state = self.lock();
        let ops = state
            .txns
            .remove(&session.id)
            .ok_or_else(|| GroupShiftError::Store("commit without open transaction".into()))?;
        state.apply(ops);
        Ok(())
    }

    pub fn rollback(&self, session: &Session) {
        self.lock().txns.remove(&session.id);
    }

    pub fn has_open_txn(&self, session: &Session) -> bool {
        self.lock().txns.contains_key(&session.id)
    }

    fn enqueue(&self, session: &Session, op: Op) -> Result<(), GroupShiftError> {
        let mut state = self.lock();
        state
            .txns
            .get_mut(&session.id)
            .ok_or_else(|| GroupShiftError::Store("mutation outside a transaction".into()))?
            .push(op);
        Ok(())
    }

    // ── Writer-side DML (fires the row listeners) ─────────────────────

    /// Insert a row as a live writer would. Fires `on_insert_post`.
    pub fn insert(
        &self,
        session: &Session,
        schema: &Arc<Schema>,
        table: TableId,
        values: Vec<Value>,
    ) -> Result<HKey, GroupShiftError> {
        let t = schema
            .table(table)
            .ok_or(GroupShiftError::TableNotFound(table))?;
        let hkey = derive_hkey(schema, table, &values)?;
        self.enqueue(
            session,
            Op::PutRow {
                key: (schema.generation, t.group, hkey.clone()),
                row: StoredRow {
                    table,
                    values: values.clone(),
                },
            },
        )?;
        let row = BoundRow::new(t.row_type.clone(), hkey.clone(), values);
        for listener in self.listeners() {
            listener.on_insert_post(session, table, &hkey, &row)?;
        }
        Ok(hkey)
    }

    /// Update a row as a live writer would: `on_update_pre` with the old
    /// image (delete phase), then `on_update_post` with the new image
    /// (write phase).
    pub fn update(
        &self,
        session: &Session,
        schema: &Arc<Schema>,
        table: TableId,
        old_values: Vec<Value>,
        new_values: Vec<Value>,
    ) -> Result<(), GroupShiftError> {
        let t = schema
            .table(table)
            .ok_or(GroupShiftError::TableNotFound(table))?;
        let old_hkey = derive_hkey(schema, table, &old_values)?;
        let new_hkey = derive_hkey(schema, table, &new_values)?;

        let old_row = BoundRow::new(t.row_type.clone(), old_hkey.clone(), old_values);
        for listener in self.listeners() {
            listener.on_update_pre(session, table, &old_hkey, &old_row)?;
        }

        self.enqueue(
            session,
            Op::RemoveRow {
                key: (schema.generation, t.group, old_hkey),
            },
        )?;
        self.enqueue(
            session,
            Op::PutRow {
                key: (schema.generation, t.group, new_hkey.clone()),
                row: StoredRow {
                    table,
                    values: new_values.clone(),
                },
            },
        )?;

        let new_row = BoundRow::new(t.row_type.clone(), new_hkey.clone(), new_values);
        for listener in self.listeners() {
            listener.on_update_post(session, table, &new_hkey, &new_row)?;
        }
        Ok(())
    }

    /// Delete a row as a live writer would. Fires `on_delete_pre`.
    pub fn delete(
        &self,
        session: &Session,
        schema: &Arc<Schema>,
        table: TableId,
        values: Vec<Value>,
    ) -> Result<(), GroupShiftError> {
        let t = schema
            .table(table)
            .ok_or(GroupShiftError::TableNotFound(table))?;
        let hkey = derive_hkey(schema, table, &values)?;
        let row = BoundRow::new(t.row_type.clone(), hkey.clone(), values);
        for listener in self.listeners() {
            listener.on_delete_pre(session, table, &hkey, &row)?;
        }
        self.enqueue(
            session,
            Op::RemoveRow {
                key: (schema.generation, t.group, hkey),
            },
        )
    }

    // ── Test inspection ───────────────────────────────────────────────

    /// Committed rows of a group within one schema's space, in hKey order.
    pub fn committed_rows(
        &self,
        schema: &Schema,
        group: GroupId,
    ) -> Vec<(HKey, TableId, Vec<Value>)> {
        let state = self.lock();
        state
            .rows
            .range((schema.generation, group, HKey::empty())..)
            .take_while(|((gen_, g, _), _)| *gen_ == schema.generation && *g == group)
            .map(|((_, _, k), r)| (k.clone(), r.table, r.values.clone()))
            .collect()
    }

    /// Committed entries of one index, in key order.
    pub fn index_values(&self, index: IndexId) -> Vec<Vec<Value>> {
        let state = self.lock();
        state
            .indexes
            .get(&index)
            .map(|m| m.values().map(|e| e.values.clone()).collect())
            .unwrap_or_default()
    }

    pub fn index_len(&self, index: IndexId) -> usize {
        let state = self.lock();
        state.indexes.get(&index).map(|m| m.len()).unwrap_or(0)
    }
}

impl Store for Arc<MemoryStore> {
    fn adapter(&self, session: &Session, schema: Arc<Schema>) -> Box<dyn StoreAdapter> {
        Box::new(MemoryAdapter {
            store: Arc::clone(self),
            session: *session,
            schema,
        })
    }
}

// ── Sequences ──────────────────────────────────────────────────────────────

/// Sequence service resolving start/increment from one schema.
///
/// Sequence state is deliberately non-transactional; gaps after a
/// rollback are expected, as with any database sequence.
struct SchemaSequences {
    store: Arc<MemoryStore>,
    schema: Arc<Schema>,
}

impl SequenceService for SchemaSequences {
    fn next_value(&self, seq: SequenceId) -> Result<i64, GroupShiftError> {
        let def = self
            .schema
            .sequence(seq)
            .ok_or_else(|| GroupShiftError::Store(format!("unknown sequence {seq:?}")))?;
        let mut slot = self
            .store
            .sequences
            .entry(seq)
            .or_insert(def.start - def.increment);
        *slot += def.increment;
        Ok(*slot)
    }
}

// ── Adapter ────────────────────────────────────────────────────────────────

struct MemoryAdapter {
    store: Arc<MemoryStore>,
    session: Session,
    schema: Arc<Schema>,
}

impl MemoryAdapter {
    fn space(&self) -> u64 {
        self.schema.generation
    }

    /// Extract an index entry's key values from a row, resolving columns
    /// of ancestor tables through the row's hKey prefix.
    fn index_key_values(
        &self,
        state: &StoreState,
        index: &Index,
        row: &dyn Row,
        hkey: &HKey,
    ) -> Result<Vec<Value>, GroupShiftError> {
        let row_table = row
            .row_type()
            .table
            .ok_or_else(|| GroupShiftError::Internal("index row without a table".into()))?;
        let group = self
            .schema
            .table(row_table)
            .map(|t| t.group)
            .ok_or(GroupShiftError::TableNotFound(row_table))?;
        index
            .columns
            .iter()
            .map(|(tid, pos)| {
                if *tid == row_table {
                    Ok(row.field(*pos).clone())
                } else {
                    state
                        .find_ancestor(self.space(), group, *tid, hkey)
                        .map(|anc| anc.values[*pos].clone())
                        .ok_or_else(|| {
                            GroupShiftError::NoSuchRow(format!(
                                "ancestor of {hkey} in table {tid:?}"
                            ))
                        })
                }
            })
            .collect()
    }

    fn index_entry_key(values: &[Value], hkey: &HKey) -> Vec<u8> {
        let mut key = Vec::new();
        for v in values {
            encode_value(&mut key, v);
        }
        key.extend_from_slice(hkey.as_bytes());
        key
    }
}

impl StoreAdapter for MemoryAdapter {
    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn write_row(
        &self,
        row: &dyn Row,
        table_indexes: &[&Index],
        group_indexes: &[&Index],
    ) -> Result<(), GroupShiftError> {
        let table = row
            .row_type()
            .table
            .ok_or_else(|| GroupShiftError::Internal("cannot write a tableless row".into()))?;
        let t = self
            .schema
            .table(table)
            .ok_or(GroupShiftError::TableNotFound(table))?;
        let hkey = row.h_key().clone();

        {
            let mut state = self.store.lock();
            let mut ops = vec![Op::PutRow {
                key: (self.space(), t.group, hkey.clone()),
                row: StoredRow {
                    table,
                    values: row.fields(),
                },
            }];
            for index in table_indexes {
                let values = self.index_key_values(&state, index, row, &hkey)?;
                ops.push(Op::PutIndex {
                    index: index.id,
                    key: Self::index_entry_key(&values, &hkey),
                    entry: IndexEntry {
                        values,
                        hkey: hkey.clone(),
                    },
                });
            }
            for index in group_indexes {
                if index.leafmost_table != table {
                    continue;
                }
                let values = self.index_key_values(&state, index, row, &hkey)?;
                ops.push(Op::PutIndex {
                    index: index.id,
                    key: Self::index_entry_key(&values, &hkey),
                    entry: IndexEntry {
                        values,
                        hkey: hkey.clone(),
                    },
                });
            }
            let txn = state
                .txns
                .get_mut(&self.session.id)
                .ok_or_else(|| GroupShiftError::Store("mutation outside a transaction".into()))?;
            txn.extend(ops);
        }

        for listener in self.store.listeners() {
            listener.on_insert_post(&self.session, table, &hkey, row)?;
        }
        Ok(())
    }

    fn delete_row(&self, row: &dyn Row, cascade: bool) -> Result<(), GroupShiftError> {
        let table = row
            .row_type()
            .table
            .ok_or_else(|| GroupShiftError::Internal("cannot delete a tableless row".into()))?;
        let t = self
            .schema
            .table(table)
            .ok_or(GroupShiftError::TableNotFound(table))?;
        let hkey = row.h_key().clone();
        let key = (self.space(), t.group, hkey.clone());

        {
            let mut state = self.store.lock();
            if !state.row_visible(self.session.id, &key) {
                return Err(GroupShiftError::NoSuchRow(format!(
                    "table {table:?} hkey {hkey}"
                )));
            }
            let mut ops = vec![Op::RemoveRow { key: key.clone() }];
            if cascade {
                let descendants: Vec<SpaceKey> = state
                    .rows
                    .range((self.space(), t.group, HKey::empty())..)
                    .take_while(|((gen_, g, _), _)| *gen_ == self.space() && *g == t.group)
                    .filter(|((_, _, k), _)| hkey.is_prefix_of(k))
                    .map(|(k, _)| k.clone())
                    .collect();
                ops.extend(descendants.into_iter().map(|key| Op::RemoveRow { key }));
            }
            // Drop index entries pointing at the deleted row.
            let stale: Vec<(IndexId, Vec<u8>)> = state
                .indexes
                .iter()
                .flat_map(|(ix, map)| {
                    let ix = *ix;
                    map.iter()
                        .filter(|(_, e)| e.hkey == hkey)
                        .map(move |(k, _)| (ix, k.clone()))
                })
                .collect();
            ops.extend(
                stale
                    .into_iter()
                    .map(|(index, key)| Op::RemoveIndex { index, key }),
            );
            let txn = state
                .txns
                .get_mut(&self.session.id)
                .ok_or_else(|| GroupShiftError::Store("mutation outside a transaction".into()))?;
            txn.extend(ops);
        }

        for listener in self.store.listeners() {
            listener.on_delete_pre(&self.session, table, &hkey, row)?;
        }
        Ok(())
    }

    fn write_index_row(
        &self,
        index: &Index,
        row: &dyn Row,
        hkey: &HKey,
    ) -> Result<(), GroupShiftError> {
        let mut state = self.store.lock();
        let values = self.index_key_values(&state, index, row, hkey)?;
        let op = Op::PutIndex {
            index: index.id,
            key: Self::index_entry_key(&values, hkey),
            entry: IndexEntry {
                values,
                hkey: hkey.clone(),
            },
        };
        state
            .txns
            .get_mut(&self.session.id)
            .ok_or_else(|| GroupShiftError::Store("mutation outside a transaction".into()))?
            .push(op);
        Ok(())
    }

    fn delete_index_row(
        &self,
        index: &Index,
        row: &dyn Row,
        hkey: &HKey,
    ) -> Result<(), GroupShiftError> {
        let mut state = self.store.lock();
        let values = self.index_key_values(&state, index, row, hkey)?;
        let op = Op::RemoveIndex {
            index: index.id,
            key: Self::index_entry_key(&values, hkey),
        };
        state
            .txns
            .get_mut(&self.session.id)
            .ok_or_else(|| GroupShiftError::Store("mutation outside a transaction".into()))?
            .push(op);
        Ok(())
    }

    fn group_index_row(
        &self,
        index: &Index,
        row: &dyn Row,
        hkey: &HKey,
        action: GroupIndexAction,
    ) -> Result<(), GroupShiftError> {
        match action {
            GroupIndexAction::Store => self.write_index_row(index, row, hkey),
            GroupIndexAction::Remove => self.delete_index_row(index, row, hkey),
        }
    }

    fn run_group_index_plan(
        &self,
        index: &Index,
        action: GroupIndexAction,
    ) -> Result<(), GroupShiftError> {
        let group = self
            .schema
            .table(index.leafmost_table)
            .map(|t| t.group)
            .ok_or(GroupShiftError::TableNotFound(index.leafmost_table))?;
        let mut state = self.store.lock();
        let leaf_rows: Vec<(HKey, StoredRow)> = state
            .rows
            .range((self.space(), group, HKey::empty())..)
            .take_while(|((gen_, g, _), _)| *gen_ == self.space() && *g == group)
            .filter(|(_, r)| r.table == index.leafmost_table)
            .map(|((_, _, k), r)| (k.clone(), r.clone()))
            .collect();
        let mut ops = Vec::with_capacity(leaf_rows.len());
        for (hkey, stored) in leaf_rows {
            let t = self
                .schema
                .table(stored.table)
                .ok_or(GroupShiftError::TableNotFound(stored.table))?;
            let row = BoundRow::new(t.row_type.clone(), hkey.clone(), stored.values);
            let values = self.index_key_values(&state, index, &row, &hkey)?;
            let key = Self::index_entry_key(&values, &hkey);
            ops.push(match action {
                GroupIndexAction::Store => Op::PutIndex {
                    index: index.id,
                    key,
                    entry: IndexEntry {
                        values,
                        hkey,
                    },
                },
                GroupIndexAction::Remove => Op::RemoveIndex {
                    index: index.id,
                    key,
                },
            });
        }
        state
            .txns
            .get_mut(&self.session.id)
            .ok_or_else(|| GroupShiftError::Store("mutation outside a transaction".into()))?
            .extend(ops);
        Ok(())
    }

    fn group_cursor(&self, plan: &GroupScanPlan) -> Result<Box<dyn GroupCursor>, GroupShiftError> {
        Ok(Box::new(MemoryCursor {
            store: Arc::clone(&self.store),
            schema: self.schema.clone(),
            plan: plan.clone(),
            last: None,
            open: false,
        }))
    }

    fn sequences(&self) -> Arc<dyn SequenceService> {
        Arc::new(SchemaSequences {
            store: Arc::clone(&self.store),
            schema: self.schema.clone(),
        })
    }
}

// ── Cursor ─────────────────────────────────────────────────────────────────

/// Read-committed group cursor.
///
/// Each `next` re-reads committed state past the last emitted hKey, so
/// rows committed by writers during the scan become visible when the
/// cursor reaches their key range. This matches the store's snapshot
/// rules across the driver's periodic commits.
struct MemoryCursor {
    store: Arc<MemoryStore>,
    schema: Arc<Schema>,
    plan: GroupScanPlan,
    last: Option<HKey>,
    open: bool,
}

impl GroupCursor for MemoryCursor {
    fn open(&mut self) -> Result<(), GroupShiftError> {
        self.open = true;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Box<dyn Row>>, GroupShiftError> {
        if !self.open {
            return Err(GroupShiftError::Store("cursor is not open".into()));
        }
        let gen_ = self.schema.generation;
        let group = self.plan.group;
        let state = self.store.lock();
        let start = match &self.last {
            None => Bound::Included((gen_, group, HKey::empty())),
            Some(k) => Bound::Excluded((gen_, group, k.clone())),
        };
        for ((g_gen, g_group, hkey), stored) in state.rows.range((start, Bound::Unbounded)) {
            if *g_gen != gen_ || *g_group != group {
                break;
            }
            if !self.plan.accepts(stored.table) {
                // Filtered-out rows still advance the cursor position.
                self.last = Some(hkey.clone());
                continue;
            }
            let t = self
                .schema
                .table(stored.table)
                .ok_or(GroupShiftError::TableNotFound(stored.table))?;
            let row = BoundRow::new(t.row_type.clone(), hkey.clone(), stored.values.clone());
            self.last = Some(hkey.clone());
            return Ok(Some(Box::new(row)));
        }
        Ok(None)
    }

    fn rebind(&mut self, after: Option<&HKey>) {
        self.last = after.cloned();
    }

    fn close(&mut self) {
        self.open = false;
    }
}

// ── Transaction service ────────────────────────────────────────────────────

/// Transaction service over [`MemoryStore`] with row-count periodic
/// commits.
pub struct MemoryTransactionService {
    store: Arc<MemoryStore>,
    commit_every: usize,
    counters: DashMap<u64, usize>,
}

impl MemoryTransactionService {
    pub fn new(store: Arc<MemoryStore>, commit_every: usize) -> Self {
        MemoryTransactionService {
            store,
            commit_every,
            counters: DashMap::new(),
        }
    }
}

impl TransactionService for MemoryTransactionService {
    fn begin(&self, session: &Session) -> Result<(), GroupShiftError> {
        self.store.begin(session);
        Ok(())
    }

    fn commit(&self, session: &Session) -> Result<(), GroupShiftError> {
        self.counters.insert(session.id, 0);
        self.store.commit(session)
    }

    fn rollback_if_open(&self, session: &Session) {
        self.counters.insert(session.id, 0);
        self.store.rollback(session);
    }

    fn periodically_commit(&self, session: &Session) -> Result<bool, GroupShiftError> {
        let mut counter = self.counters.entry(session.id).or_insert(0);
        *counter += 1;
        if *counter >= self.commit_every {
            *counter = 0;
            drop(counter);
            self.store.commit(session)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn commit_or_retry(&self, session: &Session) -> Result<bool, GroupShiftError> {
        self.counters.insert(session.id, 0);
        self.store.commit(session)?;
        Ok(false)
    }
}

// ── Schema manager ─────────────────────────────────────────────────────────

struct OnlineState {
    change_sets: Vec<ChangeSet>,
    current: Arc<Schema>,
    online: Arc<Schema>,
    active_tables: HashSet<TableId>,
    tracker: MemoryHKeyTracker,
}

/// Schema manager holding the process's single active online session.
///
/// Concurrent overlapping online DDLs are out of scope, so one slot is
/// enough; every session (the background scanner's and each writer's)
/// observes the same online state, which is what lets the hook fire for
/// writer transactions that did not start the change.
#[derive(Default)]
pub struct MemorySchemaManager {
    state: RwLock<Option<Arc<OnlineState>>>,
}

impl MemorySchemaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an online session: the pre/post schemas and change-sets.
    pub fn begin_online(
        &self,
        _session: &Session,
        current: Arc<Schema>,
        online: Arc<Schema>,
        change_sets: Vec<ChangeSet>,
    ) {
        let active_tables = change_sets.iter().map(|cs| cs.table_id).collect();
        *self.state.write().expect("online state lock") = Some(Arc::new(OnlineState {
            change_sets,
            current,
            online,
            active_tables,
            tracker: MemoryHKeyTracker::new(),
        }));
    }

    /// Discard the online state (after completion or abandon).
    pub fn end_online(&self, _session: &Session) {
        *self.state.write().expect("online state lock") = None;
    }

    fn state(&self) -> Result<Arc<OnlineState>, GroupShiftError> {
        self.state
            .read()
            .expect("online state lock")
            .clone()
            .ok_or_else(|| GroupShiftError::Store("no active online session".into()))
    }
}

impl crate::store::SchemaManager for MemorySchemaManager {
    fn online_change_sets(&self, _session: &Session) -> Result<Vec<ChangeSet>, GroupShiftError> {
        Ok(self.state()?.change_sets.clone())
    }

    fn online_schema(&self, _session: &Session) -> Result<Arc<Schema>, GroupShiftError> {
        Ok(self.state()?.online.clone())
    }

    fn current_schema(&self, _session: &Session) -> Result<Arc<Schema>, GroupShiftError> {
        Ok(self.state()?.current.clone())
    }

    fn is_online_active(&self, _session: &Session, table: TableId) -> bool {
        self.state()
            .map(|s| s.active_tables.contains(&table))
            .unwrap_or(false)
    }

    fn add_online_handled_hkey(&self, _session: &Session, table: TableId, hkey: &HKey) {
        if let Ok(state) = self.state() {
            state.tracker.save(table, hkey);
        }
    }

    fn online_handled_hkeys(
        &self,
        _session: &Session,
        table: TableId,
        start: Option<&HKey>,
    ) -> Vec<HKey> {
        self.state()
            .map(|s| s.tracker.iter_from(table, start))
            .unwrap_or_default()
    }
}
