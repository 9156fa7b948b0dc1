//! hKey tracking: the scanner/writer hand-off protocol.
//!
//! The writer path records every hKey it maintains into the tracker;
//! the scanner consults a per-table [`HKeyChecker`] to skip rows the
//! writer already handled. The tracker is the online session's single
//! point of mutable shared state: writers only append, the scanner only
//! iterates.
//!
//! `save` is idempotent by contract (ordered-set semantics). The
//! update-pre and update-post callbacks of one logical update both save
//! the same hKey, and the second save must be harmless.

use dashmap::DashMap;
use std::collections::BTreeSet;

use crate::hkey::HKey;
use crate::schema::TableId;

/// Persistent, per-table set of writer-handled hKeys.
///
/// Implementations must be safe for concurrent `save` callers and a
/// single iterating reader per scan transaction. An append committed
/// before the reader's snapshot is visible to it; one not yet committed
/// is not.
pub trait HKeyTracker: Send + Sync {
    /// Record a writer-handled hKey. Idempotent.
    fn save(&self, table: TableId, hkey: &HKey);

    /// Materialize the ascending sequence of saved hKeys `>= start`
    /// (all of them when `start` is `None`), as of the caller's
    /// transaction snapshot.
    fn iter_from(&self, table: TableId, start: Option<&HKey>) -> Vec<HKey>;
}

// ── In-memory tracker ──────────────────────────────────────────────────────

/// Tracker backed by in-process ordered sets.
///
/// The production deployment scopes tracker state to a store subspace so
/// visibility follows the store's transactions; this implementation
/// applies saves eagerly, which is sufficient for a single-writer
/// process where writer transactions commit before the scanner's next
/// snapshot begins.
#[derive(Debug, Default)]
pub struct MemoryHKeyTracker {
    sets: DashMap<TableId, BTreeSet<HKey>>,
}

impl MemoryHKeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hKeys recorded for a table.
    pub fn len(&self, table: TableId) -> usize {
        self.sets.get(&table).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, table: TableId) -> bool {
        self.len(table) == 0
    }
}

impl HKeyTracker for MemoryHKeyTracker {
    fn save(&self, table: TableId, hkey: &HKey) {
        self.sets.entry(table).or_default().insert(hkey.clone());
    }

    fn iter_from(&self, table: TableId, start: Option<&HKey>) -> Vec<HKey> {
        match self.sets.get(&table) {
            None => Vec::new(),
            Some(set) => match start {
                None => set.iter().cloned().collect(),
                Some(s) => set.range(s.clone()..).cloned().collect(),
            },
        }
    }
}

// ── Checker ────────────────────────────────────────────────────────────────

/// Forward-only membership probe over one materialized tracker snapshot.
///
/// Valid for the duration of one scan transaction: probes must arrive in
/// ascending hKey order (the group scan guarantees this), and the cursor
/// never rewinds. The driver discards checkers at every commit and
/// rollback boundary and requests fresh ones from the next snapshot.
#[derive(Debug)]
pub struct HKeyChecker {
    keys: Vec<HKey>,
    pos: usize,
}

impl HKeyChecker {
    pub fn new(keys: Vec<HKey>) -> Self {
        debug_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        HKeyChecker { keys, pos: 0 }
    }

    /// A checker that reports every hKey as unseen. Used for row types
    /// that no concrete table backs.
    pub fn never() -> Self {
        HKeyChecker {
            keys: Vec::new(),
            pos: 0,
        }
    }

    /// Whether the writer already handled `hkey`.
    pub fn seen(&mut self, hkey: &HKey) -> bool {
        while self.pos < self.keys.len() && self.keys[self.pos] < *hkey {
            self.pos += 1;
        }
        self.pos < self.keys.len() && self.keys[self.pos] == *hkey
    }
}
