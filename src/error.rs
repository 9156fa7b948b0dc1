//! Error types for groupshift.
//!
//! All errors that can occur within the engine are represented by
//! [`GroupShiftError`]. Errors are propagated via
//! `Result<T, GroupShiftError>` throughout the codebase; the embedding
//! server converts them to SQL error codes at its API boundary.
//!
//! # Error Classification
//!
//! Errors are classified into kinds that determine how the engine reacts:
//! - **User** — inconsistent change-set input. Never recovered.
//! - **Schema** — the old/new schema pair is incoherent (missing column,
//!   unresolvable cast). Fatal to the online session.
//! - **Rollback** — the store forced the current transaction to roll
//!   back. The scan driver recovers by rebinding to the last committed
//!   watermark; everyone else propagates.
//! - **Policy** — concurrent DML arrived while the server forbids it.
//! - **Constraint** — a row failed a NOT NULL or domain check.
//! - **Store** — a store/transaction failure that is not rollback-class.
//! - **Internal** — bugs.
//!
//! # Commit Retry Policy
//!
//! The final commit of a scan may ask for a retry. [`CommitRetryPolicy`]
//! bounds how many times the driver will loop before giving up with
//! [`GroupShiftError::CommitRetriesExhausted`].

use std::fmt;

use crate::schema::TableId;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum GroupShiftError {
    // ── User errors — inconsistent change-set input ───────────────────────
    /// `classify` was called with no change-sets.
    #[error("no change-sets supplied for online session")]
    EmptyChangeSets,

    /// Two change-sets in the same session carry different change levels.
    #[error("mixed change levels in one session: {0} vs {1}")]
    MixedChangeLevels(&'static str, &'static str),

    /// The same table id appears in more than one change-set.
    #[error("table {0:?} appears in more than one change-set")]
    DuplicateChangeSet(TableId),

    // ── Schema errors — (old, new) pair is incoherent; fatal ──────────────
    /// A table id present in a change-set does not resolve in the schema.
    #[error("table {0:?} not found in schema")]
    TableNotFound(TableId),

    /// A non-ADD change references a column the old table does not have.
    #[error("column {column} of table {table:?} not found in old schema")]
    ColumnNotFound { table: TableId, column: String },

    /// An ADD/MODIFY index change did not resolve against the new schema.
    #[error("index {0} not found after resolution against new schema")]
    IndexNotFound(String),

    /// No cast is registered between the old and new column types.
    #[error("no cast from {from} to {to}")]
    CastNotFound { from: &'static str, to: &'static str },

    /// A zero-argument default function is not registered.
    #[error("default function {0} not found")]
    FunctionNotFound(String),

    /// A default literal could not be parsed as the column's type.
    #[error("cannot parse default literal {literal:?} as {ty}")]
    BadDefaultLiteral { literal: String, ty: &'static str },

    /// A DROP change in the column-change list names a column that exists
    /// in the new table. Assertion-grade: the DDL controller produced a
    /// contradictory change-set.
    #[error("projection source for new column {0} resolved to a DROP change")]
    ProjectionColumnMissing(String),

    // ── Policy errors ─────────────────────────────────────────────────────
    /// Concurrent DML fired while the server is configured to forbid it.
    #[error("concurrent DML is not allowed during online schema change")]
    ConcurrentDmlNotAllowed,

    // ── Constraint errors ─────────────────────────────────────────────────
    /// A row violated a NOT NULL constraint of the new schema.
    #[error("column {column} of table {table:?} is NOT NULL but row {hkey} holds null")]
    NotNullViolation {
        table: TableId,
        column: String,
        hkey: String,
    },

    /// A row value fell outside the column type's domain.
    #[error("value for column {column} of table {table:?} out of domain: {detail}")]
    DomainViolation {
        table: TableId,
        column: String,
        detail: String,
    },

    // ── Store errors ──────────────────────────────────────────────────────
    /// The store forced the current transaction to roll back. The scan
    /// driver treats this as recoverable; all other callers propagate.
    #[error("transaction rolled back by store: {0}")]
    RollbackRequested(String),

    /// A logical delete found no row. Non-fatal when the concurrent DML
    /// hook deletes a projected pre-image the scanner has not yet
    /// promoted; fatal elsewhere.
    #[error("no such row: {0}")]
    NoSuchRow(String),

    /// The final commit kept asking for a retry past the configured budget.
    #[error("final commit still retrying after {0} attempts")]
    CommitRetriesExhausted(u32),

    /// Any other store failure.
    #[error("store error: {0}")]
    Store(String),

    // ── Internal errors — should not happen ───────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GroupShiftError {
    /// Whether the scan driver may recover from this error by rolling
    /// back, rebinding to the last committed hKey, and resuming.
    pub fn is_rollback(&self) -> bool {
        matches!(self, GroupShiftError::RollbackRequested(_))
    }

    /// Whether this error terminates the online session outright.
    ///
    /// Rollback-class errors are recoverable; `NoSuchRow` is contextually
    /// non-fatal (the hook logs it); everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            GroupShiftError::RollbackRequested(_) | GroupShiftError::NoSuchRow(_)
        )
    }

    /// Classify the error for monitoring and the embedding server's
    /// error-code mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GroupShiftError::EmptyChangeSets
            | GroupShiftError::MixedChangeLevels(_, _)
            | GroupShiftError::DuplicateChangeSet(_) => ErrorKind::User,

            GroupShiftError::TableNotFound(_)
            | GroupShiftError::ColumnNotFound { .. }
            | GroupShiftError::IndexNotFound(_)
            | GroupShiftError::CastNotFound { .. }
            | GroupShiftError::FunctionNotFound(_)
            | GroupShiftError::BadDefaultLiteral { .. }
            | GroupShiftError::ProjectionColumnMissing(_) => ErrorKind::Schema,

            GroupShiftError::ConcurrentDmlNotAllowed => ErrorKind::Policy,

            GroupShiftError::NotNullViolation { .. } | GroupShiftError::DomainViolation { .. } => {
                ErrorKind::Constraint
            }

            GroupShiftError::RollbackRequested(_) => ErrorKind::Rollback,

            GroupShiftError::NoSuchRow(_)
            | GroupShiftError::CommitRetriesExhausted(_)
            | GroupShiftError::Store(_) => ErrorKind::Store,

            GroupShiftError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    Schema,
    Policy,
    Constraint,
    Rollback,
    Store,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::User => write!(f, "USER"),
            ErrorKind::Schema => write!(f, "SCHEMA"),
            ErrorKind::Policy => write!(f, "POLICY"),
            ErrorKind::Constraint => write!(f, "CONSTRAINT"),
            ErrorKind::Rollback => write!(f, "ROLLBACK"),
            ErrorKind::Store => write!(f, "STORE"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

// ── Commit retry policy ────────────────────────────────────────────────────

/// Bounds the final-commit retry loop of the scan driver.
///
/// The transaction service may answer "retry" to the commit that closes a
/// scan. The driver gives up after `max_attempts` and surfaces
/// [`GroupShiftError::CommitRetriesExhausted`] instead of looping forever.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CommitRetryPolicy {
    /// Maximum number of commit attempts before giving up.
    pub max_attempts: u32,
}

impl Default for CommitRetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

impl CommitRetryPolicy {
    /// Whether the given attempt (0-based) is within the budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
