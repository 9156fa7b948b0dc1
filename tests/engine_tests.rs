//! Integration tests for the online schema change engine.
//!
//! These run the full engine — classifier, transform cache, scan
//! driver, concurrent-DML hook, tracker — against the reference
//! in-memory store, including the scanner/writer races the engine
//! exists to get right.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use groupshift::api::OnlineEngine;
use groupshift::changeset::{Change, ChangeLevel, ChangeSet, IndexChange};
use groupshift::config::EngineConfig;
use groupshift::error::GroupShiftError;
use groupshift::mem::{MemorySchemaManager, MemoryStore, MemoryTransactionService};
use groupshift::schema::{Column, ColumnDefault, IndexKind, Schema, TableId};
use groupshift::store::{SchemaManager, Session, TransactionService};
use groupshift::types::{TypeClass, Value};

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    store: Arc<MemoryStore>,
    manager: Arc<MemorySchemaManager>,
    old: Arc<Schema>,
    new: Arc<Schema>,
    session: Session,
}

impl Harness {
    fn new(old: Arc<Schema>, new: Arc<Schema>, change_sets: Vec<ChangeSet>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(MemorySchemaManager::new());
        let session = Session::new(1);
        manager.begin_online(&session, old.clone(), new.clone(), change_sets);
        Harness {
            store,
            manager,
            old,
            new,
            session,
        }
    }

    fn engine_with_txn(&self, txn: Arc<dyn TransactionService>) -> OnlineEngine {
        let engine = OnlineEngine::new(
            self.manager.clone(),
            txn,
            Arc::new(self.store.clone()),
            groupshift::types::TypesRegistry,
            EngineConfig::default(),
        );
        self.store.register_listener(Arc::new(engine.hook()));
        engine
    }

    fn engine(&self, commit_every: usize) -> OnlineEngine {
        self.engine_with_txn(Arc::new(MemoryTransactionService::new(
            self.store.clone(),
            commit_every,
        )))
    }

    fn seed(&self, rows: &[Vec<Value>]) {
        let writer = Session::new(99);
        self.store.begin(&writer);
        for values in rows {
            self.store
                .insert(&writer, &self.old, TableId(1), values.clone())
                .unwrap();
        }
        self.store.commit(&writer).unwrap();
    }

    fn writer_insert(&self, values: Vec<Value>) -> Result<(), GroupShiftError> {
        let writer = Session::new(7);
        self.store.begin(&writer);
        self.store
            .insert(&writer, &self.old, TableId(1), values)?;
        self.store.commit(&writer)
    }
}

fn item_schema(generation: u64) -> Arc<Schema> {
    Schema::builder(generation)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
            ],
            vec![0],
        )
        .build()
}

fn items(n: i32) -> Vec<Vec<Value>> {
    (1..=n)
        .map(|i| vec![Value::Int(i), Value::Text(format!("n{i}"))])
        .collect()
}

// ── Scenario 1: add nullable column with default literal 'x' ───────────────

#[test]
fn add_column_with_literal_default_fills_every_row() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
                Column::new("status", TypeClass::Text)
                    .with_default(ColumnDefault::Literal("x".into())),
            ],
            vec![0],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::Table).with_column(Change::add("status"))];
    let h = Harness::new(old, new, cs);
    h.seed(&items(3));

    let stats = h.engine(10).alter_table(&h.session, None).unwrap();
    assert_eq!(stats.rows_handled, 3);

    let group = h.new.table(TableId(1)).unwrap().group;
    let rows = h.store.committed_rows(&h.new, group);
    assert_eq!(rows.len(), 3);
    for (_, _, values) in &rows {
        assert_eq!(values[2], Value::Text("x".into()));
    }
}

// ── Scenario 2: NOT NULL tightening over a violating row ───────────────────

#[test]
fn not_null_check_names_the_violating_row() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text).not_null(),
            ],
            vec![0],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::MetadataNotNull)];
    let h = Harness::new(old, new, cs);
    h.seed(&[
        vec![Value::Int(1), Value::Text("a".into())],
        vec![Value::Int(2), Value::Text("b".into())],
        vec![Value::Int(3), Value::Null],
    ]);

    let err = h
        .engine(10)
        .check_table_constraints(&h.session, None)
        .unwrap_err();
    match err {
        GroupShiftError::NotNullViolation { table, column, hkey } => {
            assert_eq!(table, TableId(1));
            assert_eq!(column, "name");
            assert!(!hkey.is_empty());
        }
        other => panic!("expected NotNullViolation, got {other:?}"),
    }
    // No indexes were written and no transaction is left open.
    assert!(!h.store.has_open_txn(&h.session));
}

#[test]
fn not_null_check_passes_when_all_rows_satisfy() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text).not_null(),
            ],
            vec![0],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::MetadataNotNull)];
    let h = Harness::new(old, new, cs);
    h.seed(&items(5));

    let group = h.old.table(TableId(1)).unwrap().group;
    let before = h.store.committed_rows(&h.old, group);
    let stats = h.engine(10).check_table_constraints(&h.session, None).unwrap();
    assert_eq!(stats.rows_handled, 5);
    // No row was mutated.
    assert_eq!(h.store.committed_rows(&h.old, group), before);
}

// ── Scenario 3: index build racing a concurrent insert ─────────────────────

/// Transaction service that runs a writer-side insert the first time the
/// scanner consults it, simulating DML arriving mid-scan.
struct InterleavingTxn {
    inner: MemoryTransactionService,
    calls: AtomicU32,
    at_call: u32,
    insert: Box<dyn Fn() + Send + Sync>,
}

impl TransactionService for InterleavingTxn {
    fn begin(&self, session: &Session) -> Result<(), GroupShiftError> {
        self.inner.begin(session)
    }
    fn commit(&self, session: &Session) -> Result<(), GroupShiftError> {
        self.inner.commit(session)
    }
    fn rollback_if_open(&self, session: &Session) {
        self.inner.rollback_if_open(session)
    }
    fn periodically_commit(&self, session: &Session) -> Result<bool, GroupShiftError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.at_call {
            (self.insert)();
        }
        self.inner.periodically_commit(session)
    }
    fn commit_or_retry(&self, session: &Session) -> Result<bool, GroupShiftError> {
        self.inner.commit_or_retry(session)
    }
}

#[test]
fn index_build_deduplicates_against_concurrent_insert() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
            ],
            vec![0],
        )
        .table_index(TableId(1), "item_name", vec![1])
        .build();
    let cs = vec![
        ChangeSet::new(TableId(1), ChangeLevel::Index)
            .with_index(IndexChange::add(IndexKind::Table, "item_name")),
    ];
    let h = Harness::new(old, new.clone(), cs);
    h.seed(&items(2));

    let h_store = h.store.clone();
    let h_old = h.old.clone();
    let txn = Arc::new(InterleavingTxn {
        inner: MemoryTransactionService::new(h.store.clone(), 1),
        calls: AtomicU32::new(0),
        at_call: 1,
        insert: Box::new(move || {
            let writer = Session::new(7);
            h_store.begin(&writer);
            h_store
                .insert(
                    &writer,
                    &h_old,
                    TableId(1),
                    vec![Value::Int(3), Value::Text("n3".into())],
                )
                .unwrap();
            h_store.commit(&writer).unwrap();
        }),
    });
    let engine = h.engine_with_txn(txn);
    let stats = engine.build_indexes(&h.session, None).unwrap();

    // The scanner reached row 3 and skipped it: the writer's hook had
    // already built its entry and recorded the hKey.
    assert_eq!(stats.rows_handled, 2);
    assert_eq!(stats.rows_skipped, 1);
    assert_eq!(
        h.manager
            .online_handled_hkeys(&h.session, TableId(1), None)
            .len(),
        1
    );

    let ix = new.index_by_name("item_name").unwrap().id;
    // index_values comes back in key order, which is name order here.
    let entries = h.store.index_values(ix);
    assert_eq!(
        entries,
        vec![
            vec![Value::Text("n1".into())],
            vec![Value::Text("n2".into())],
            vec![Value::Text("n3".into())],
        ]
    );
}

// ── Scenario 4: INT → BIGINT widening ──────────────────────────────────────

#[test]
fn alter_widens_int_pk_to_bigint() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::BigInt).not_null(),
                Column::new("name", TypeClass::Text),
            ],
            vec![0],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::Table).with_column(Change::modify("id", "id"))];
    let h = Harness::new(old, new, cs);
    h.seed(&[vec![Value::Int(2_147_483_647), Value::Text("max".into())]]);

    h.engine(10).alter_table(&h.session, None).unwrap();

    let group = h.new.table(TableId(1)).unwrap().group;
    let rows = h.store.committed_rows(&h.new, group);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].2[0], Value::BigInt(2_147_483_647));
}

// ── Scenario 5: rollback mid-scan, rebind, no row handled twice ────────────

/// Transaction service that fails one periodic-commit consultation with
/// a rollback-class error.
struct FailingTxn {
    inner: MemoryTransactionService,
    calls: AtomicU32,
    fail_at: u32,
}

impl TransactionService for FailingTxn {
    fn begin(&self, session: &Session) -> Result<(), GroupShiftError> {
        self.inner.begin(session)
    }
    fn commit(&self, session: &Session) -> Result<(), GroupShiftError> {
        self.inner.commit(session)
    }
    fn rollback_if_open(&self, session: &Session) {
        self.inner.rollback_if_open(session)
    }
    fn periodically_commit(&self, session: &Session) -> Result<bool, GroupShiftError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return Err(GroupShiftError::RollbackRequested("injected".into()));
        }
        self.inner.periodically_commit(session)
    }
    fn commit_or_retry(&self, session: &Session) -> Result<bool, GroupShiftError> {
        self.inner.commit_or_retry(session)
    }
}

#[test]
fn rollback_mid_alter_resumes_without_gaps_or_repeats() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
                Column::new("status", TypeClass::Text)
                    .with_default(ColumnDefault::Literal("x".into())),
            ],
            vec![0],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::Table).with_column(Change::add("status"))];
    let h = Harness::new(old, new, cs);
    h.seed(&items(100));

    // Periodic commit every 10 rows; the consultation at row 47 rolls
    // the transaction back.
    let txn = Arc::new(FailingTxn {
        inner: MemoryTransactionService::new(h.store.clone(), 10),
        calls: AtomicU32::new(0),
        fail_at: 47,
    });
    let engine = h.engine_with_txn(txn);
    let stats = engine.alter_table(&h.session, None).unwrap();

    assert_eq!(stats.rebinds, 1);
    // 1-47 handled before the failure (row 47's writes rolled back),
    // 41-100 after the rebind.
    assert_eq!(stats.rows_handled, 47 + 60);

    // The new space holds every row exactly once.
    let group = h.new.table(TableId(1)).unwrap().group;
    let rows = h.store.committed_rows(&h.new, group);
    assert_eq!(rows.len(), 100);
    let mut ids: Vec<i32> = rows
        .iter()
        .map(|(_, _, v)| match &v[0] {
            Value::Int(i) => *i,
            _ => panic!("int id expected"),
        })
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids, (1..=100).collect::<Vec<_>>());
}

// ── Scenario 6: mixed change levels ────────────────────────────────────────

#[test]
fn mixed_change_levels_fail_with_no_side_effects() {
    let old = item_schema(1);
    let new = item_schema(2);
    let cs = vec![
        ChangeSet::new(TableId(1), ChangeLevel::Index),
        ChangeSet::new(TableId(1), ChangeLevel::Table),
    ];
    let h = Harness::new(old, new, cs);
    h.seed(&items(2));

    let err = h.engine(10).alter_table(&h.session, None).unwrap_err();
    assert!(matches!(err, GroupShiftError::MixedChangeLevels(_, _)));

    let group = h.new.table(TableId(1)).unwrap().group;
    assert!(h.store.committed_rows(&h.new, group).is_empty());
    assert!(!h.store.has_open_txn(&h.session));
}

// ── Boundary: writer first, scanner second — one materialization ───────────

#[test]
fn writer_then_scanner_materializes_once() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
                Column::new("status", TypeClass::Text)
                    .with_default(ColumnDefault::Literal("x".into())),
            ],
            vec![0],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::Table).with_column(Change::add("status"))];
    let h = Harness::new(old, new, cs);
    h.seed(&items(2));
    let engine = h.engine(10);

    // A writer inserts row 3 while the session is online, before the
    // scanner starts. The hook promotes it and records its hKey.
    h.writer_insert(vec![Value::Int(3), Value::Text("n3".into())])
        .unwrap();

    let stats = engine.alter_table(&h.session, None).unwrap();
    assert_eq!(stats.rows_handled, 2);
    assert_eq!(stats.rows_skipped, 1);

    let group = h.new.table(TableId(1)).unwrap().group;
    let rows = h.store.committed_rows(&h.new, group);
    assert_eq!(rows.len(), 3);
}

// ── Boundary: writer update after the scanner has passed ───────────────────

#[test]
fn writer_update_after_scan_applies_to_promoted_row() {
    let old = item_schema(1);
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "item",
            vec![
                Column::new("id", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
                Column::new("status", TypeClass::Text)
                    .with_default(ColumnDefault::Literal("x".into())),
            ],
            vec![0],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::Table).with_column(Change::add("status"))];
    let h = Harness::new(old, new, cs);
    h.seed(&items(3));
    let engine = h.engine(10);
    engine.alter_table(&h.session, None).unwrap();

    // The scan is complete; a writer now updates row 2. The hook must
    // find the promoted row and apply the update to it directly.
    let writer = Session::new(7);
    h.store.begin(&writer);
    h.store
        .update(
            &writer,
            &h.old,
            TableId(1),
            vec![Value::Int(2), Value::Text("n2".into())],
            vec![Value::Int(2), Value::Text("renamed".into())],
        )
        .unwrap();
    h.store.commit(&writer).unwrap();

    let group = h.new.table(TableId(1)).unwrap().group;
    let rows = h.store.committed_rows(&h.new, group);
    assert_eq!(rows.len(), 3);
    let updated = rows
        .iter()
        .find(|(_, _, v)| v[0] == Value::Int(2))
        .expect("row 2 present");
    assert_eq!(updated.2[1], Value::Text("renamed".into()));
    assert_eq!(updated.2[2], Value::Text("x".into()));
}

// ── Group scan covers child tables ─────────────────────────────────────────

#[test]
fn group_rewrite_carries_children_of_unchanged_tables() {
    let old = Schema::builder(1)
        .root_table(
            TableId(1),
            "customer",
            vec![
                Column::new("cid", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
            ],
            vec![0],
        )
        .child_table(
            TableId(2),
            "order",
            TableId(1),
            vec![0],
            vec![
                Column::new("cid", TypeClass::Int).not_null(),
                Column::new("oid", TypeClass::Int).not_null(),
            ],
            vec![1],
        )
        .build();
    let new = Schema::builder(2)
        .root_table(
            TableId(1),
            "customer",
            vec![
                Column::new("cid", TypeClass::Int).not_null(),
                Column::new("name", TypeClass::Text),
                Column::new("tier", TypeClass::Text)
                    .with_default(ColumnDefault::Literal("basic".into())),
            ],
            vec![0],
        )
        .child_table(
            TableId(2),
            "order",
            TableId(1),
            vec![0],
            vec![
                Column::new("cid", TypeClass::Int).not_null(),
                Column::new("oid", TypeClass::Int).not_null(),
            ],
            vec![1],
        )
        .build();
    let cs = vec![ChangeSet::new(TableId(1), ChangeLevel::Table).with_column(Change::add("tier"))];
    let h = Harness::new(old.clone(), new.clone(), cs);

    let writer = Session::new(99);
    h.store.begin(&writer);
    h.store
        .insert(
            &writer,
            &old,
            TableId(1),
            vec![Value::Int(1), Value::Text("alice".into())],
        )
        .unwrap();
    h.store
        .insert(&writer, &old, TableId(2), vec![Value::Int(1), Value::Int(10)])
        .unwrap();
    h.store.commit(&writer).unwrap();

    let stats = h.engine(10).alter_table(&h.session, None).unwrap();
    assert_eq!(stats.rows_handled, 2);

    let group = new.table(TableId(1)).unwrap().group;
    let rows = h.store.committed_rows(&new, group);
    assert_eq!(rows.len(), 2);
    // Parent first (hKey order), with the new column; child unchanged.
    assert_eq!(rows[0].1, TableId(1));
    assert_eq!(rows[0].2.len(), 3);
    assert_eq!(rows[1].1, TableId(2));
    assert_eq!(rows[1].2, vec![Value::Int(1), Value::Int(10)]);
}
