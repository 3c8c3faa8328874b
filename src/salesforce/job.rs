//! Bulk job value object and its state machine.
//!
//! A [`BulkJob`] is the single handle a flow passes between calls while a
//! server-side job is in flight. State only ever changes through
//! [`BulkJob::apply_server_state`] (driven by server responses) or the
//! explicit upload-complete transition; once terminal, a job never moves
//! again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::salesforce::BulkJobState;

// ─────────────────────────────────────────────────────────────────────────────
// Job Classification
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of the Bulk API a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Ingest,
    Query,
}

/// Bulk operation type.
///
/// Serializes to the exact strings the API expects: lowercase for ingest
/// operations, `query` / `queryAll` for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "upsert")]
    Upsert,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "queryAll")]
    QueryAll,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
            Operation::Query => "query",
            Operation::QueryAll => "queryAll",
        }
    }

    pub fn kind(self) -> JobKind {
        match self {
            Operation::Query | Operation::QueryAll => JobKind::Query,
            _ => JobKind::Ingest,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkJob
// ─────────────────────────────────────────────────────────────────────────────

/// One server-side asynchronous job, tracked across repeated network calls.
#[derive(Debug, Clone)]
pub struct BulkJob {
    /// Opaque identifier assigned by the server.
    pub id: String,
    pub kind: JobKind,
    pub operation: Operation,
    /// Object API name (ingest) or SOQL text (query).
    pub target: String,
    pub state: BulkJobState,
    pub created_at: DateTime<Utc>,
    /// Set when the job first reaches a terminal state.
    pub closed_at: Option<DateTime<Utc>>,
    /// Continuation token for the next result page (query jobs).
    pub locator: Option<String>,
    /// Partition sub-jobs, in the server's listing order (chunked queries).
    pub chunk_job_ids: Vec<String>,
}

impl BulkJob {
    /// A freshly created ingest job. The server reports it `Open`.
    pub fn new_ingest(id: String, operation: Operation, object: String) -> Self {
        Self {
            id,
            kind: JobKind::Ingest,
            operation,
            target: object,
            state: BulkJobState::Open,
            created_at: Utc::now(),
            closed_at: None,
            locator: None,
            chunk_job_ids: Vec::new(),
        }
    }

    /// A freshly created query job, with any partition jobs the server
    /// allocated. Query jobs begin processing immediately.
    pub fn new_query(
        id: String,
        operation: Operation,
        soql: String,
        state: BulkJobState,
        chunk_job_ids: Vec<String>,
    ) -> Self {
        Self {
            id,
            kind: JobKind::Query,
            operation,
            target: soql,
            state,
            created_at: Utc::now(),
            closed_at: None,
            locator: None,
            chunk_job_ids,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// True when this query job was partitioned server-side.
    pub fn is_chunked(&self) -> bool {
        !self.chunk_job_ids.is_empty()
    }

    /// Guards an operation that requires the job to still accept data.
    pub fn require_open(&self, operation: &'static str) -> Result<(), AppError> {
        if self.state != BulkJobState::Open {
            return Err(AppError::InvalidState {
                job_id: self.id.clone(),
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Guards administrative operations (abort, delete) against jobs that
    /// have already finished.
    pub fn require_not_terminal(&self, operation: &'static str) -> Result<(), AppError> {
        if self.is_terminal() {
            return Err(AppError::InvalidState {
                job_id: self.id.clone(),
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// `Open` → `UploadComplete`. Idempotent while the job is in either of
    /// those states; anything else is a usage error.
    pub fn mark_upload_complete(&mut self) -> Result<(), AppError> {
        match self.state {
            BulkJobState::Open => {
                self.state = BulkJobState::UploadComplete;
                Ok(())
            }
            BulkJobState::UploadComplete => Ok(()),
            _ => Err(AppError::InvalidState {
                job_id: self.id.clone(),
                operation: "close",
                state: self.state,
            }),
        }
    }

    /// Folds a server-reported state into the handle.
    ///
    /// Terminal states stick: once closed, later reports cannot reopen the
    /// job. Returns the state now held.
    pub fn apply_server_state(&mut self, reported: BulkJobState) -> BulkJobState {
        if !self.is_terminal() {
            self.state = reported;
            if self.state.is_terminal() {
                self.closed_at = Some(Utc::now());
            }
        }
        self.state
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
