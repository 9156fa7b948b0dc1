//! Change-set model and the change-level classifier.
//!
//! A DDL controller publishes one [`ChangeSet`] per affected table. The
//! classifier reduces the collection to a single [`ChangeLevel`] that
//! picks the migration strategy, and collects the indexes the session
//! must build. Both fail closed: empty input, disagreeing levels, and a
//! table id appearing twice are all rejected before any side effect.
//!
//! Change-sets are what the schema manager persists for an online
//! session, hence the serde derives.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::GroupShiftError;
use crate::schema::{IndexId, IndexKind, Schema, TableId};

/// What happened to a column or index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Add,
    Drop,
    Modify,
}

/// A single per-column alteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub old_name: Option<String>,
    pub new_name: Option<String>,
}

impl Change {
    pub fn add(new_name: impl Into<String>) -> Self {
        Change {
            kind: ChangeKind::Add,
            old_name: None,
            new_name: Some(new_name.into()),
        }
    }

    pub fn drop(old_name: impl Into<String>) -> Self {
        Change {
            kind: ChangeKind::Drop,
            old_name: Some(old_name.into()),
            new_name: None,
        }
    }

    pub fn modify(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Change {
            kind: ChangeKind::Modify,
            old_name: Some(old_name.into()),
            new_name: Some(new_name.into()),
        }
    }
}

/// A single per-index alteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChange {
    pub kind: ChangeKind,
    pub category: IndexKind,
    pub old_name: Option<String>,
    pub new_name: Option<String>,
}

impl IndexChange {
    pub fn add(category: IndexKind, new_name: impl Into<String>) -> Self {
        IndexChange {
            kind: ChangeKind::Add,
            category,
            old_name: None,
            new_name: Some(new_name.into()),
        }
    }

    pub fn drop(category: IndexKind, old_name: impl Into<String>) -> Self {
        IndexChange {
            kind: ChangeKind::Drop,
            category,
            old_name: Some(old_name.into()),
            new_name: None,
        }
    }

    pub fn modify(
        category: IndexKind,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        IndexChange {
            kind: ChangeKind::Modify,
            category,
            old_name: Some(old_name.into()),
            new_name: Some(new_name.into()),
        }
    }
}

/// The coarse migration strategy, totally ordered by cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeLevel {
    /// Only nullability tightens; existing rows are verified, not rewritten.
    MetadataNotNull,
    /// Indexes are added or dropped; rows stay put.
    Index,
    /// Row shape changes within the same group.
    Table,
    /// Row shape and/or parent-child grouping changes.
    Group,
}

impl ChangeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeLevel::MetadataNotNull => "METADATA_NOT_NULL",
            ChangeLevel::Index => "INDEX",
            ChangeLevel::Table => "TABLE",
            ChangeLevel::Group => "GROUP",
        }
    }
}

/// All alterations of one table in one online session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub table_id: TableId,
    pub level: ChangeLevel,
    pub column_changes: Vec<Change>,
    pub index_changes: Vec<IndexChange>,
}

impl ChangeSet {
    pub fn new(table_id: TableId, level: ChangeLevel) -> Self {
        ChangeSet {
            table_id,
            level,
            column_changes: Vec::new(),
            index_changes: Vec::new(),
        }
    }

    pub fn with_column(mut self, change: Change) -> Self {
        self.column_changes.push(change);
        self
    }

    pub fn with_index(mut self, change: IndexChange) -> Self {
        self.index_changes.push(change);
        self
    }
}

// ── Classifier ─────────────────────────────────────────────────────────────

/// Reduce a session's change-sets to their common change level.
///
/// Fails closed: empty input, any two levels disagreeing, or the same
/// table id appearing twice are all errors, raised before any side
/// effect of the session.
pub fn classify(change_sets: &[ChangeSet]) -> Result<ChangeLevel, GroupShiftError> {
    let mut level: Option<ChangeLevel> = None;
    let mut seen: HashSet<TableId> = HashSet::new();
    for cs in change_sets {
        if !seen.insert(cs.table_id) {
            return Err(GroupShiftError::DuplicateChangeSet(cs.table_id));
        }
        match level {
            None => level = Some(cs.level),
            Some(l) if l == cs.level => {}
            Some(l) => {
                return Err(GroupShiftError::MixedChangeLevels(
                    l.as_str(),
                    cs.level.as_str(),
                ));
            }
        }
    }
    level.ok_or(GroupShiftError::EmptyChangeSets)
}

/// Collect the indexes the session must build, resolved against the new
/// schema.
///
/// Visits every ADD and MODIFY index change. A group index referenced
/// from every table it spans resolves to the same [`IndexId`], so set
/// semantics return it exactly once.
pub fn find_indexes_to_build(
    change_sets: &[ChangeSet],
    new_schema: &Schema,
) -> Result<BTreeSet<IndexId>, GroupShiftError> {
    let mut out = BTreeSet::new();
    for cs in change_sets {
        for ic in &cs.index_changes {
            if !matches!(ic.kind, ChangeKind::Add | ChangeKind::Modify) {
                continue;
            }
            let name = ic
                .new_name
                .as_deref()
                .ok_or_else(|| GroupShiftError::Internal("index change without new name".into()))?;
            let resolved = new_schema
                .index_by_name(name)
                .filter(|ix| ix.kind == ic.category)
                .ok_or_else(|| GroupShiftError::IndexNotFound(name.to_string()))?;
            out.insert(resolved.id);
        }
    }
    Ok(out)
}
