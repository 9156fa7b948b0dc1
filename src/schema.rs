//! The in-memory catalog (AIS): tables, columns, indexes, groups, sequences.
//!
//! A [`Schema`] is immutable once built and always fully constructed
//! before the engine observes it. The cyclic references (table → group →
//! tables) are modeled arena-and-index: [`TableId`], [`GroupId`] and
//! [`IndexId`] are stable identifiers resolved through the schema's
//! lookup maps, so the same table id can be resolved against both the
//! old and the new schema of an online session.
//!
//! Each schema carries a generic cache slot. The transform cache for an
//! online session is attached there, so it lives exactly as long as the
//! (old, new) schema pair and vanishes when either schema pointer is
//! swapped.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh64::Xxh64;

use crate::types::TypeClass;

// ── Identifiers ────────────────────────────────────────────────────────────

/// Stable table identifier, persistent across schema generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TableId(pub u32);

/// Group identifier within one schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct GroupId(pub u32);

/// Index identifier within one schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct IndexId(pub u32);

/// Sequence identifier (identity-column generators).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SequenceId(pub u32);

/// Name of the auto-generated hidden primary key column.
pub const HIDDEN_PK_NAME: &str = "__pk";

// ── Columns ────────────────────────────────────────────────────────────────

/// Default-value source for a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnDefault {
    /// No declared default; a new column without an old source gets null.
    None,
    /// A literal default, parsed through the type's from-string routine.
    Literal(String),
    /// A zero-argument function default, e.g. `CURRENT_TIMESTAMP`.
    Function(String),
    /// An identity generator; new values come from the sequence.
    Identity(SequenceId),
}

/// A column of a table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub class: TypeClass,
    pub nullable: bool,
    pub default: ColumnDefault,
}

impl Column {
    /// Shorthand for a plain nullable column with no default.
    pub fn new(name: impl Into<String>, class: TypeClass) -> Self {
        Column {
            name: name.into(),
            class,
            nullable: true,
            default: ColumnDefault::None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: ColumnDefault) -> Self {
        self.default = default;
        self
    }
}

// ── Row types ──────────────────────────────────────────────────────────────

/// The shape of rows a cursor or transform produces.
///
/// `table` is set when a concrete table backs the type; synthetic row
/// types (e.g. the output of a flattened scan stage) leave it unset.
#[derive(Debug, Clone)]
pub struct RowType {
    pub table: Option<TableId>,
    pub fields: Vec<TypeClass>,
}

impl RowType {
    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

// ── Tables, indexes, groups, sequences ─────────────────────────────────────

/// A table within a group.
#[derive(Debug, Clone)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<Column>,
    /// Positions of the primary-key columns, in key order.
    pub pk: Vec<usize>,
    /// When set, the last column is the auto-generated hidden PK
    /// ([`HIDDEN_PK_NAME`]) and `pk` points at it.
    pub hidden_pk: bool,
    pub group: GroupId,
    pub parent: Option<TableId>,
    /// Positions of the columns joining this table to its parent's
    /// primary key, in parent-PK order. Empty for root tables.
    pub parent_join: Vec<usize>,
    /// Position of this table within its group's hKey space.
    pub ordinal: u8,
    /// Depth in the group tree; the root is 0.
    pub depth: u8,
    /// Table indexes declared on this table.
    pub indexes: Vec<IndexId>,
    /// Shared row type for rows of this table.
    pub row_type: Arc<RowType>,
}

impl Table {
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column count including the hidden PK column if present.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Index category, mirroring the change-set model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IndexKind {
    Table,
    Group,
    FullText,
}

/// A table, group, or full-text index.
#[derive(Debug, Clone)]
pub struct Index {
    pub id: IndexId,
    pub name: String,
    pub kind: IndexKind,
    /// Key columns as (table, column position) pairs. Table indexes
    /// reference a single table; group indexes may span several.
    pub columns: Vec<(TableId, usize)>,
    /// The deepest table contributing key columns. For a table index
    /// this is the declaring table; for a group index it decides which
    /// table's change-set owns the build.
    pub leafmost_table: TableId,
}

/// A set of tables joined by parent-child relationships, sharing a
/// storage namespace and hKey ordering.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub root: TableId,
    pub tables: Vec<TableId>,
    pub indexes: Vec<IndexId>,
}

/// An identity-column generator.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: SequenceId,
    pub name: String,
    pub start: i64,
    pub increment: i64,
}

// ── Schema ─────────────────────────────────────────────────────────────────

/// One immutable generation of the catalog.
pub struct Schema {
    pub generation: u64,
    tables: Vec<Table>,
    groups: Vec<Group>,
    indexes: Vec<Index>,
    sequences: Vec<Sequence>,
    table_ids: HashMap<TableId, usize>,
    group_ids: HashMap<GroupId, usize>,
    index_ids: HashMap<IndexId, usize>,
    sequence_ids: HashMap<SequenceId, usize>,
    index_names: HashMap<String, IndexId>,
    /// Generic cache slot; the transform cache for an online session is
    /// attached here. Populated under the lock on first read.
    cache: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("generation", &self.generation)
            .field("tables", &self.tables.len())
            .field("groups", &self.groups.len())
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

impl Schema {
    pub fn builder(generation: u64) -> SchemaBuilder {
        SchemaBuilder::new(generation)
    }

    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.table_ids.get(&id).map(|&i| &self.tables[i])
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.group_ids.get(&id).map(|&i| &self.groups[i])
    }

    pub fn index(&self, id: IndexId) -> Option<&Index> {
        self.index_ids.get(&id).map(|&i| &self.indexes[i])
    }

    pub fn index_by_name(&self, name: &str) -> Option<&Index> {
        self.index_names.get(name).and_then(|&id| self.index(id))
    }

    pub fn sequence(&self, id: SequenceId) -> Option<&Sequence> {
        self.sequence_ids.get(&id).map(|&i| &self.sequences[i])
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    /// The root table of the group containing `table`.
    pub fn root_of(&self, table: TableId) -> Option<TableId> {
        let t = self.table(table)?;
        self.group(t.group).map(|g| g.root)
    }

    /// Walk a table's ancestor chain, root first, ending at the table.
    pub fn ancestry(&self, table: TableId) -> Vec<TableId> {
        let mut chain = Vec::new();
        let mut cur = Some(table);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.table(id).and_then(|t| t.parent);
        }
        chain.reverse();
        chain
    }

    /// Digest of the schema's shape (ids, names, column types, index
    /// layout). Two generations with the same shape fingerprint alike;
    /// the transform cache keys on the (old, new) fingerprint pair.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Xxh64::new(0);
        h.update(&self.generation.to_le_bytes());
        for t in &self.tables {
            h.update(&t.id.0.to_le_bytes());
            h.update(t.name.as_bytes());
            h.update(&[t.ordinal, t.depth, u8::from(t.hidden_pk)]);
            for c in &t.columns {
                h.update(c.name.as_bytes());
                h.update(c.class.name().as_bytes());
                h.update(&[u8::from(c.nullable)]);
            }
        }
        for ix in &self.indexes {
            h.update(&ix.id.0.to_le_bytes());
            h.update(ix.name.as_bytes());
            for (tid, pos) in &ix.columns {
                h.update(&tid.0.to_le_bytes());
                h.update(&(*pos as u64).to_le_bytes());
            }
        }
        h.digest()
    }

    /// Fetch the cached value of type `T`, building it with `init` on
    /// first read. The slot holds one value for the schema's lifetime.
    pub fn cached<T, E, F>(&self, init: F) -> Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<Arc<T>, E>,
    {
        let mut slot = self.cache.lock().expect("schema cache lock poisoned");
        if let Some(existing) = slot.as_ref()
            && let Ok(typed) = Arc::clone(existing).downcast::<T>()
        {
            return Ok(typed);
        }
        let built = init()?;
        *slot = Some(built.clone() as Arc<dyn Any + Send + Sync>);
        Ok(built)
    }
}

// ── Builder ────────────────────────────────────────────────────────────────

/// Fluent construction of an immutable [`Schema`].
///
/// The DDL controller (and the tests) build schemas with this; the
/// engine itself never mutates one.
pub struct SchemaBuilder {
    generation: u64,
    tables: Vec<Table>,
    groups: Vec<Group>,
    indexes: Vec<Index>,
    sequences: Vec<Sequence>,
    next_group: u32,
    next_index: u32,
}

impl SchemaBuilder {
    fn new(generation: u64) -> Self {
        SchemaBuilder {
            generation,
            tables: Vec::new(),
            groups: Vec::new(),
            indexes: Vec::new(),
            sequences: Vec::new(),
            next_group: 1,
            // Index ids carry the generation in their high bits so ids
            // from the old and new schema of one session never collide
            // in the store's shared index namespace.
            next_index: ((generation as u32) << 16) | 1,
        }
    }

    /// Add a root table, creating its group.
    pub fn root_table(
        mut self,
        id: TableId,
        name: &str,
        mut columns: Vec<Column>,
        pk: Vec<usize>,
    ) -> Self {
        let group = GroupId(self.next_group);
        self.next_group += 1;
        let hidden_pk = pk.is_empty();
        let pk = if hidden_pk {
            // Tables without a declared PK get the auto-generated hidden
            // PK column, fed by an implicit identity sequence.
            let seq = SequenceId(0x8000_0000 | id.0);
            self.sequences.push(Sequence {
                id: seq,
                name: format!("{name}$pk"),
                start: 1,
                increment: 1,
            });
            columns.push(
                Column::new(HIDDEN_PK_NAME, TypeClass::BigInt)
                    .not_null()
                    .with_default(ColumnDefault::Identity(seq)),
            );
            vec![columns.len() - 1]
        } else {
            pk
        };
        let row_type = Arc::new(RowType {
            table: Some(id),
            fields: columns.iter().map(|c| c.class).collect(),
        });
        self.tables.push(Table {
            id,
            name: name.to_string(),
            columns,
            pk,
            hidden_pk,
            group,
            parent: None,
            parent_join: Vec::new(),
            ordinal: 1,
            depth: 0,
            indexes: Vec::new(),
            row_type,
        });
        self.groups.push(Group {
            id: group,
            root: id,
            tables: vec![id],
            indexes: Vec::new(),
        });
        self
    }

    /// Add a child table under `parent`. `parent_join` names this
    /// table's columns matching the parent's primary key, in key order.
    pub fn child_table(
        mut self,
        id: TableId,
        name: &str,
        parent: TableId,
        parent_join: Vec<usize>,
        columns: Vec<Column>,
        pk: Vec<usize>,
    ) -> Self {
        let (group, depth) = {
            let p = self
                .tables
                .iter()
                .find(|t| t.id == parent)
                .expect("parent table must be added first");
            (p.group, p.depth + 1)
        };
        let ordinal = self
            .groups
            .iter()
            .find(|g| g.id == group)
            .map(|g| g.tables.len() as u8 + 1)
            .expect("group exists");
        let row_type = Arc::new(RowType {
            table: Some(id),
            fields: columns.iter().map(|c| c.class).collect(),
        });
        self.tables.push(Table {
            id,
            name: name.to_string(),
            columns,
            pk,
            hidden_pk: false,
            group,
            parent: Some(parent),
            parent_join,
            ordinal,
            depth,
            indexes: Vec::new(),
            row_type,
        });
        let g = self
            .groups
            .iter_mut()
            .find(|g| g.id == group)
            .expect("group exists");
        g.tables.push(id);
        self
    }

    /// Add a table index on `table` over the given column positions.
    pub fn table_index(mut self, table: TableId, name: &str, columns: Vec<usize>) -> Self {
        let id = IndexId(self.next_index);
        self.next_index += 1;
        self.indexes.push(Index {
            id,
            name: name.to_string(),
            kind: IndexKind::Table,
            columns: columns.into_iter().map(|p| (table, p)).collect(),
            leafmost_table: table,
        });
        let t = self
            .tables
            .iter_mut()
            .find(|t| t.id == table)
            .expect("index table must be added first");
        t.indexes.push(id);
        self
    }

    /// Add a group index spanning `columns` (table, position) pairs.
    /// The leafmost participating table is computed from table depth.
    pub fn group_index(mut self, name: &str, columns: Vec<(TableId, usize)>) -> Self {
        let id = IndexId(self.next_index);
        self.next_index += 1;
        let leafmost = columns
            .iter()
            .map(|(tid, _)| *tid)
            .max_by_key(|tid| {
                self.tables
                    .iter()
                    .find(|t| t.id == *tid)
                    .map(|t| t.depth)
                    .unwrap_or(0)
            })
            .expect("group index needs at least one column");
        let group = self
            .tables
            .iter()
            .find(|t| t.id == leafmost)
            .map(|t| t.group)
            .expect("leafmost table exists");
        self.indexes.push(Index {
            id,
            name: name.to_string(),
            kind: IndexKind::Group,
            columns,
            leafmost_table: leafmost,
        });
        let g = self
            .groups
            .iter_mut()
            .find(|g| g.id == group)
            .expect("group exists");
        g.indexes.push(id);
        self
    }

    /// Add an identity-generator sequence.
    pub fn sequence(mut self, id: SequenceId, name: &str, start: i64, increment: i64) -> Self {
        self.sequences.push(Sequence {
            id,
            name: name.to_string(),
            start,
            increment,
        });
        self
    }

    pub fn build(self) -> Arc<Schema> {
        let table_ids = self
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        let group_ids = self
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.id, i))
            .collect();
        let index_ids = self
            .indexes
            .iter()
            .enumerate()
            .map(|(i, ix)| (ix.id, i))
            .collect();
        let sequence_ids = self
            .sequences
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, i))
            .collect();
        let index_names = self
            .indexes
            .iter()
            .map(|ix| (ix.name.clone(), ix.id))
            .collect();
        Arc::new(Schema {
            generation: self.generation,
            tables: self.tables,
            groups: self.groups,
            indexes: self.indexes,
            sequences: self.sequences,
            table_ids,
            group_ids,
            index_ids,
            sequence_ids,
            index_names,
            cache: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeClass;

    fn two_level_schema() -> Arc<Schema> {
        Schema::builder(1)
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
                    Column::new("total", TypeClass::Double),
                ],
                vec![1],
            )
            .table_index(TableId(2), "order_total", vec![2])
            .group_index("customer_order_name", vec![(TableId(1), 1), (TableId(2), 2)])
            .build()
    }

    #[test]
    fn test_builder_wires_group_membership() {
        let schema = two_level_schema();
        let customer = schema.table(TableId(1)).unwrap();
        let order = schema.table(TableId(2)).unwrap();
        assert_eq!(customer.group, order.group);
        let group = schema.group(customer.group).unwrap();
        assert_eq!(group.root, TableId(1));
        assert_eq!(group.tables, vec![TableId(1), TableId(2)]);
    }

    #[test]
    fn test_ordinals_and_depth() {
        let schema = two_level_schema();
        assert_eq!(schema.table(TableId(1)).unwrap().ordinal, 1);
        assert_eq!(schema.table(TableId(2)).unwrap().ordinal, 2);
        assert_eq!(schema.table(TableId(2)).unwrap().depth, 1);
    }

    #[test]
    fn test_ancestry_root_first() {
        let schema = two_level_schema();
        assert_eq!(schema.ancestry(TableId(2)), vec![TableId(1), TableId(2)]);
        assert_eq!(schema.ancestry(TableId(1)), vec![TableId(1)]);
    }

    #[test]
    fn test_group_index_leafmost() {
        let schema = two_level_schema();
        let gi = schema.index_by_name("customer_order_name").unwrap();
        assert_eq!(gi.kind, IndexKind::Group);
        assert_eq!(gi.leafmost_table, TableId(2));
    }

    #[test]
    fn test_hidden_pk_synthesized_when_no_pk() {
        let schema = Schema::builder(1)
            .root_table(
                TableId(7),
                "log",
                vec![Column::new("msg", TypeClass::Text)],
                vec![],
            )
            .build();
        let t = schema.table(TableId(7)).unwrap();
        assert!(t.hidden_pk);
        let hidden = t.columns.last().unwrap();
        assert_eq!(hidden.name, HIDDEN_PK_NAME);
        assert!(matches!(hidden.default, ColumnDefault::Identity(_)));
        assert_eq!(t.pk, vec![1]);
    }

    #[test]
    fn test_fingerprint_sensitive_to_columns() {
        let a = two_level_schema();
        let b = Schema::builder(1)
            .root_table(
                TableId(1),
                "customer",
                vec![
                    Column::new("cid", TypeClass::Int).not_null(),
                    Column::new("name", TypeClass::Text),
                    Column::new("extra", TypeClass::Int),
                ],
                vec![0],
            )
            .build();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_cache_slot_memoizes() {
        let schema = two_level_schema();
        let mut builds = 0;
        for _ in 0..3 {
            let v: Arc<u64> = schema
                .cached(|| {
                    builds += 1;
                    Ok::<_, ()>(Arc::new(42u64))
                })
                .unwrap();
            assert_eq!(*v, 42);
        }
        assert_eq!(builds, 1);
    }

    #[test]
    fn test_row_type_backed_by_table() {
        let schema = two_level_schema();
        let rt = &schema.table(TableId(2)).unwrap().row_type;
        assert!(rt.has_table());
        assert_eq!(rt.field_count(), 3);
        assert_eq!(rt.fields[2], TypeClass::Double);
    }
}
