//! Background scan driver.
//!
//! Drives a cursor over a group scan to completion, invoking a per-row
//! handler, while surviving the two hazards of a long-running scan:
//!
//! - **Transaction size** — the driver consults the transaction service
//!   after every row and commits periodically. Each commit records the
//!   current row as the last-committed watermark and discards the
//!   checker cache (checker iterators are only valid within one
//!   transaction snapshot).
//! - **Forced rollback** — when the store rolls the transaction back
//!   mid-scan, the driver rolls back, begins a fresh transaction,
//!   reopens the cursor, rebinds the leaf to the watermark, and resumes.
//!   Rows between the watermark and the failure point are re-handled;
//!   nothing before the watermark is revisited.
//!
//! The driver is a plain state machine (scanning → recovering /
//! final-commit → done); there is nothing asynchronous about it.
//! Cancellation is cooperative: a non-rollback-class error from the
//! handler aborts the scan and propagates.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{CommitRetryPolicy, GroupShiftError};
use crate::hkey::HKey;
use crate::row::Row;
use crate::schema::TableId;
use crate::store::{GroupCursor, SchemaManager, Session, TransactionService};
use crate::tracker::HKeyChecker;

/// Per-row callback. Runs inside the driver's current transaction.
pub type RowHandler<'a> = dyn FnMut(&dyn Row) -> Result<(), GroupShiftError> + 'a;

/// Counters reported by a completed scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Rows passed to the handler.
    pub rows_handled: u64,
    /// Rows skipped because the writer path already handled them.
    pub rows_skipped: u64,
    /// Periodic commits taken.
    pub commits: u64,
    /// Rollback-triggered rebinds.
    pub rebinds: u64,
}

enum State {
    Scanning,
    Recovering,
    FinalCommit,
    Done,
}

/// The scan driver for one online session.
pub struct ScanDriver<'a> {
    session: &'a Session,
    txn: &'a dyn TransactionService,
    manager: &'a dyn SchemaManager,
    retry: CommitRetryPolicy,
}

impl<'a> ScanDriver<'a> {
    pub fn new(
        session: &'a Session,
        txn: &'a dyn TransactionService,
        manager: &'a dyn SchemaManager,
        retry: CommitRetryPolicy,
    ) -> Self {
        ScanDriver {
            session,
            txn,
            manager,
            retry,
        }
    }

    /// Drive `cursor` to completion under the session's open
    /// transaction, applying `handler` to every row the writer path has
    /// not already handled.
    ///
    /// Commit boundaries are transparent to the caller: on return the
    /// scan's last batch is committed. The caller owns opening the first
    /// transaction and rolling back after a fatal error.
    pub fn run_plan(
        &self,
        cursor: &mut dyn GroupCursor,
        handler: &mut RowHandler<'_>,
    ) -> Result<ScanStats, GroupShiftError> {
        let mut checkers: HashMap<Option<TableId>, HKeyChecker> = HashMap::new();
        let mut watermark: Option<HKey> = None;
        let mut stats = ScanStats::default();
        let mut commit_attempts: u32 = 0;

        cursor.open()?;
        let mut state = State::Scanning;
        loop {
            state = match state {
                State::Scanning => {
                    match self.scan_step(cursor, handler, &mut checkers, &watermark, &mut stats) {
                        Ok(StepOutcome::More(committed_at)) => {
                            if let Some(hkey) = committed_at {
                                watermark = Some(hkey);
                            }
                            State::Scanning
                        }
                        Ok(StepOutcome::Exhausted) => State::FinalCommit,
                        Err(e) if e.is_rollback() => {
                            warn!(session = self.session.id, error = %e, "scan rolled back; rebinding");
                            State::Recovering
                        }
                        Err(e) => {
                            cursor.close();
                            return Err(e);
                        }
                    }
                }

                State::Recovering => {
                    self.txn.rollback_if_open(self.session);
                    self.txn.begin(self.session)?;
                    cursor.close();
                    cursor.open()?;
                    cursor.rebind(watermark.as_ref());
                    checkers.clear();
                    stats.rebinds += 1;
                    let resumed_at = match &watermark {
                        Some(k) => k.to_string(),
                        None => "start".to_string(),
                    };
                    debug!(session = self.session.id, watermark = %resumed_at, "scan resumed");
                    State::Scanning
                }

                State::FinalCommit => {
                    if self.txn.commit_or_retry(self.session)? {
                        commit_attempts += 1;
                        if !self.retry.should_retry(commit_attempts) {
                            cursor.close();
                            return Err(GroupShiftError::CommitRetriesExhausted(commit_attempts));
                        }
                        debug!(
                            session = self.session.id,
                            attempt = commit_attempts,
                            "final commit asked to retry"
                        );
                        self.txn.begin(self.session)?;
                        cursor.close();
                        cursor.open()?;
                        cursor.rebind(watermark.as_ref());
                        checkers.clear();
                        State::Scanning
                    } else {
                        State::Done
                    }
                }

                State::Done => {
                    cursor.close();
                    debug!(
                        session = self.session.id,
                        handled = stats.rows_handled,
                        skipped = stats.rows_skipped,
                        commits = stats.commits,
                        rebinds = stats.rebinds,
                        "scan complete"
                    );
                    return Ok(stats);
                }
            };
        }
    }

    /// Process one cursor row. Returns the new watermark when a periodic
    /// commit was taken at this row.
    fn scan_step(
        &self,
        cursor: &mut dyn GroupCursor,
        handler: &mut RowHandler<'_>,
        checkers: &mut HashMap<Option<TableId>, HKeyChecker>,
        watermark: &Option<HKey>,
        stats: &mut ScanStats,
    ) -> Result<StepOutcome, GroupShiftError> {
        let Some(row) = cursor.next()? else {
            return Ok(StepOutcome::Exhausted);
        };

        let table = row.row_type().table;
        let checker = checkers.entry(table).or_insert_with(|| match table {
            // A row type no concrete table backs cannot have been touched
            // by the writer path.
            None => HKeyChecker::never(),
            Some(tid) => HKeyChecker::new(self.manager.online_handled_hkeys(
                self.session,
                tid,
                watermark.as_ref(),
            )),
        });

        if checker.seen(row.h_key()) {
            stats.rows_skipped += 1;
        } else {
            handler(&*row)?;
            stats.rows_handled += 1;
        }

        let mut committed_at = None;
        if self.txn.periodically_commit(self.session)? {
            committed_at = Some(row.h_key().clone());
            checkers.clear();
            self.txn.begin(self.session)?;
            stats.commits += 1;
        }
        Ok(StepOutcome::More(committed_at))
    }
}

enum StepOutcome {
    /// A row was processed; carries the watermark when this row closed a
    /// committed batch.
    More(Option<HKey>),
    Exhausted,
}
