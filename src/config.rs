//! Engine configuration.
//!
//! The embedding server hands the engine one [`EngineConfig`] per process.
//! All knobs have production defaults; the struct deserializes from the
//! server's config file section.

use serde::Deserialize;

use crate::error::CommitRetryPolicy;

/// Configuration for the online schema change engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Whether writer transactions may run DML against a table that is
    /// under online change. When false, any concurrent-DML hook firing is
    /// a fatal error for that writer.
    pub allow_concurrent_dml: bool,

    /// How many handled rows the scan driver processes before asking the
    /// transaction service whether to take a periodic commit.
    ///
    /// The service owns the actual decision; this is the polling cadence.
    /// Lower values shorten the redo window after a rollback at the cost
    /// of more commit traffic.
    pub commit_every_rows: usize,

    /// Bound on the final-commit retry loop.
    pub commit_retry: CommitRetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_concurrent_dml: true,
            commit_every_rows: 1_000,
            commit_retry: CommitRetryPolicy::default(),
        }
    }
}
