//! groupshift — online schema change for a grouped, ordered key/value
//! SQL store.
//!
//! The engine rebuilds indexes and rewrites table rows to a new schema
//! *concurrently* with live DML. A long-running, periodically-committing
//! background scan races short writer transactions over the same rows;
//! the two paths deduplicate through a shared, append-only hKey tracker
//! so every row is materialized into the new schema exactly once.
//!
//! # Architecture
//!
//! - A DDL controller publishes a change-set and a new schema through
//!   the [`store::SchemaManager`].
//! - The [`changeset`] classifier reduces the session to one change
//!   level: metadata-only, index build, table rewrite, or group rewrite.
//! - The [`transform`] cache compiles a per-table migration plan
//!   (projection expressions, row checker, index targets), memoized on
//!   the new schema for the life of the (old, new) pair.
//! - The [`scan`] driver walks each affected group in hKey order with
//!   periodic commits and rollback-rebind recovery.
//! - The [`hook`] listener mirrors concurrent writer DML into the new
//!   schema and records each handled hKey in the [`tracker`].
//! - [`api::OnlineEngine`] exposes the three public operations:
//!   `build_indexes`, `check_table_constraints`, `alter_table`.
//!
//! The underlying ordered store, transaction manager, and schema
//! manager stay behind the traits in [`store`]; [`mem`] provides the
//! reference single-process implementations the integration tests run
//! against.

pub mod api;
pub mod changeset;
pub mod config;
pub mod error;
pub mod expr;
pub mod hkey;
pub mod hook;
pub mod mem;
pub mod row;
pub mod scan;
pub mod schema;
pub mod store;
pub mod tracker;
pub mod transform;
pub mod types;

pub use api::OnlineEngine;
pub use changeset::{Change, ChangeLevel, ChangeSet, IndexChange, classify};
pub use config::EngineConfig;
pub use error::{ErrorKind, GroupShiftError};
pub use hkey::HKey;
pub use schema::{Schema, TableId};
