//! Salesforce Bulk API 2.0 interaction layer.
//!
//! This module provides the authenticated HTTP transport, the ingest and
//! query job clients, and the polling machinery that drives a job from
//! creation to a terminal state. Key conventions:
//!
//! - The server is the sole source of truth for job progress; nothing here
//!   infers completion from elapsed time or record counts.
//! - Auth headers, tokens, raw SOQL, and CSV contents are never logged.
//!   Only HTTP method, path, and status codes are logged; job ids are
//!   redacted to their first 8 characters.

pub mod auth;
pub mod bulk_ingest;
pub mod bulk_query;
pub mod client;
pub mod job;
pub mod poll;
pub mod scheduler;

use serde::{Deserialize, Serialize};

pub use auth::fetch_token;
pub use bulk_ingest::BulkIngestClient;
pub use bulk_query::BulkQueryClient;
pub use client::SalesforceClient;
pub use job::{BulkJob, JobKind, Operation};
pub use poll::{poll_until_done, PollPolicy};
pub use scheduler::PollScheduler;

// ─────────────────────────────────────────────────────────────────────────────
// Job States
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a Bulk API 2.0 job, as reported by the server.
///
/// Ingest jobs move `Open` → `UploadComplete` → `InProgress` → terminal;
/// query jobs skip `Open` and start processing immediately after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkJobState {
    /// Job accepts uploaded data (ingest only).
    Open,
    /// All input delivered; server begins processing.
    UploadComplete,
    /// Server is processing.
    InProgress,
    /// Terminal: processed successfully (row-level failures possible).
    JobComplete,
    /// Terminal: job-level failure.
    Failed,
    /// Terminal: aborted by a client.
    Aborted,
    /// A state this client does not know about. Treated as non-terminal.
    #[serde(other)]
    Unknown,
}

impl BulkJobState {
    /// True once the job can no longer change state. No job is ever reopened.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BulkJobState::JobComplete | BulkJobState::Failed | BulkJobState::Aborted
        )
    }
}

/// The three states a finished job can land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    JobComplete,
    Failed,
    Aborted,
}

impl TerminalState {
    /// Converts a server-reported state, if it is terminal.
    pub fn from_state(state: BulkJobState) -> Option<Self> {
        match state {
            BulkJobState::JobComplete => Some(TerminalState::JobComplete),
            BulkJobState::Failed => Some(TerminalState::Failed),
            BulkJobState::Aborted => Some(TerminalState::Aborted),
            _ => None,
        }
    }

    pub fn as_state(self) -> BulkJobState {
        match self {
            TerminalState::JobComplete => BulkJobState::JobComplete,
            TerminalState::Failed => BulkJobState::Failed,
            TerminalState::Aborted => BulkJobState::Aborted,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Redacts a job ID for logging (shows first 8 chars).
pub(crate) fn redact_id(id: &str) -> String {
    if id.len() > 8 {
        format!("{}...", &id[..8])
    } else {
        id.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
