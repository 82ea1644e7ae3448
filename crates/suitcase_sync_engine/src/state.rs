//! Run states, results and progress.

use crate::error::{Result, SyncError};
use std::fmt;

/// The state of a sync run.
///
/// `Init -> SchemaFetched -> Paging -> Flushing -> Done`, with `Failed`
/// reachable from any non-terminal state and `Cancelled` from any state
/// before `Flushing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing has happened yet.
    Init,
    /// The table schema has been fetched.
    SchemaFetched,
    /// Rows are being transferred.
    Paging,
    /// Output is being flushed and counts finalized.
    Flushing,
    /// Run completed.
    Done,
    /// Run aborted on a fatal error.
    Failed,
    /// Run stopped at a cancellation check.
    Cancelled,
}

impl SyncState {
    /// Returns true for `Done`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Done | SyncState::Failed | SyncState::Cancelled)
    }

    /// Returns true if `next` may follow this state.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Init, SchemaFetched)
            | (SchemaFetched, Paging)
            | (SchemaFetched, Done)
            | (Paging, Flushing)
            | (Flushing, Done) => true,
            (Init | SchemaFetched | Paging, Cancelled) => true,
            _ => false,
        }
    }

    /// Checks and returns the next state.
    pub fn transition(self, next: SyncState) -> Result<SyncState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SyncError::InvalidStateTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Init => "init",
            SyncState::SchemaFetched => "schema_fetched",
            SyncState::Paging => "paging",
            SyncState::Flushing => "flushing",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
            SyncState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A row that could not be transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Row identifier, or `line N` when the row had none.
    pub row_id: String,
    /// What went wrong.
    pub message: String,
}

impl RowError {
    /// Creates a row error.
    pub fn new(row_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            row_id: row_id.into(),
            message: message.into(),
        }
    }
}

/// Counts and errors of a completed or cancelled run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Rows written to the CSV (download) or accepted by the server (upload).
    pub rows_processed: u64,
    /// Attachments transferred.
    pub attachments_fetched: u64,
    /// Attachments already present locally and left alone.
    pub attachments_skipped: u64,
    /// Attachments whose transfer failed.
    pub attachments_failed: u64,
    /// Row and attachment errors, in the order they happened.
    pub errors: Vec<RowError>,
}

impl SyncResult {
    /// Returns true if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.attachments_failed == 0 && self.errors.is_empty()
    }
}

/// Outcome of a task that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task ran to completion.
    Completed(SyncResult),
    /// The task stopped at a cancellation check; counts cover the work done
    /// before it.
    Cancelled(SyncResult),
}

impl TaskOutcome {
    /// Counts of the run.
    pub fn result(&self) -> &SyncResult {
        match self {
            TaskOutcome::Completed(r) | TaskOutcome::Cancelled(r) => r,
        }
    }

    /// Returns true if the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled(_))
    }

    /// Converts to a plain result, mapping cancellation to `SyncError::Cancelled`.
    pub fn into_result(self) -> Result<SyncResult> {
        match self {
            TaskOutcome::Completed(r) => Ok(r),
            TaskOutcome::Cancelled(_) => Err(SyncError::Cancelled),
        }
    }
}

/// Cumulative counts reported after each page or batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Current state.
    pub state: Option<SyncState>,
    /// Pages or batches completed.
    pub pages: u64,
    /// Rows completed.
    pub rows: u64,
    /// Attachments transferred.
    pub attachments_fetched: u64,
    /// Attachment transfers that failed.
    pub attachments_failed: u64,
}

impl Progress {
    pub(crate) fn snapshot(state: SyncState, pages: u64, result: &SyncResult) -> Self {
        Self {
            state: Some(state),
            pages,
            rows: result.rows_processed,
            attachments_fetched: result.attachments_fetched,
            attachments_failed: result.attachments_failed,
        }
    }
}
