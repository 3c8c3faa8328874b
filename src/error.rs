use thiserror::Error;

use crate::salesforce::BulkJobState;

/// Application-wide error type.
///
/// Variants are grouped by where in a run they can occur. Only
/// `RateLimited` and transient connection failures are ever retried, and
/// only inside the transport layer; everything else propagates to the
/// caller unmodified.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Auth ──────────────────────────────────────────────────────────────────
    #[error("Authentication failed: {0}")]
    Auth(String),

    // ── API ───────────────────────────────────────────────────────────────────
    #[error("Rejected request (HTTP {status}): {message}")]
    Request { status: u16, message: String },

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    // ── Bulk jobs ─────────────────────────────────────────────────────────────
    #[error("Cannot {operation} job {job_id} in state {state:?}")]
    InvalidState {
        job_id: String,
        operation: &'static str,
        state: BulkJobState,
    },

    #[error("Bulk job {job_id} ended in state {state:?}: {message}")]
    JobFailed {
        job_id: String,
        state: BulkJobState,
        message: String,
    },

    #[error("Job {job_id} still running after {waited_secs}s; resume polling with the same job id")]
    PollTimeout { job_id: String, waited_secs: u64 },

    #[error("Export failed: partition job(s) did not complete: {}", failed.join(", "))]
    ChunkFailure { failed: Vec<String> },

    #[error("Job {job_id} reported {reported} outcome rows for {submitted} submitted rows")]
    ResultCountMismatch {
        job_id: String,
        submitted: u64,
        reported: u64,
    },

    // ── Conversion ────────────────────────────────────────────────────────────
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    // ── Environment ───────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Process exit code for the CLI.
    ///
    /// 2 = authentication failure, 3 = transport/request failure,
    /// 4 = partial data failure, 1 = everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Auth(_) => 2,
            AppError::Request { .. }
            | AppError::RateLimited { .. }
            | AppError::NotFound(_)
            | AppError::Connection(_) => 3,
            AppError::ResultCountMismatch { .. } => 4,
            AppError::InvalidState { .. }
            | AppError::JobFailed { .. }
            | AppError::PollTimeout { .. }
            | AppError::ChunkFailure { .. }
            | AppError::Encoding(_)
            | AppError::Mapping(_)
            | AppError::Config(_)
            | AppError::Internal(_) => 1,
        }
    }

    /// True for errors the transport layer may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::RateLimited { .. } | AppError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_exit_2() {
        assert_eq!(AppError::Auth("bad token".into()).exit_code(), 2);
    }

    #[test]
    fn transport_errors_exit_3() {
        let errors = [
            AppError::Request {
                status: 400,
                message: "MALFORMED_QUERY".into(),
            },
            AppError::RateLimited {
                retry_after_secs: Some(30),
            },
            AppError::NotFound("750xx".into()),
            AppError::Connection("timeout".into()),
        ];
        for e in errors {
            assert_eq!(e.exit_code(), 3, "wrong exit code for {:?}", e);
        }
    }

    #[test]
    fn partial_data_errors_exit_4() {
        let e = AppError::ResultCountMismatch {
            job_id: "750xx".into(),
            submitted: 10,
            reported: 9,
        };
        assert_eq!(e.exit_code(), 4);
    }

    #[test]
    fn total_failures_exit_1() {
        let errors = [
            AppError::ChunkFailure {
                failed: vec!["750aa".into()],
            },
            AppError::PollTimeout {
                job_id: "750xx".into(),
                waited_secs: 600,
            },
            AppError::Mapping("index 12 out of range".into()),
            AppError::Config("missing mapping".into()),
        ];
        for e in errors {
            assert_eq!(e.exit_code(), 1, "wrong exit code for {:?}", e);
        }
    }

    #[test]
    fn only_rate_limit_and_connection_are_transient() {
        assert!(AppError::RateLimited {
            retry_after_secs: None
        }
        .is_transient());
        assert!(AppError::Connection("reset".into()).is_transient());
        assert!(!AppError::Auth("nope".into()).is_transient());
        assert!(!AppError::Request {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn chunk_failure_names_all_partitions() {
        let e = AppError::ChunkFailure {
            failed: vec!["750aa".into(), "750bb".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("750aa"));
        assert!(msg.contains("750bb"));
    }
}
