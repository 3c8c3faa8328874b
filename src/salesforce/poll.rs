//! Bounded polling of a job until the server reports a terminal state.
//!
//! The server is always re-read; nothing here infers completion from
//! elapsed time or record counts. A timeout aborts only the caller's wait:
//! the job keeps running server-side and the caller may resume by polling
//! the same job id again.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::AppError;
use crate::salesforce::{redact_id, BulkJobState, TerminalState};

// ─────────────────────────────────────────────────────────────────────────────
// PollPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// How long to wait between status checks, and for how long in total.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// First wait between checks.
    pub initial_interval: Duration,
    /// Interval ceiling for the backoff variant.
    pub max_interval: Duration,
    /// Overall wait budget. Exhausting it raises `PollTimeout`.
    pub max_wait: Duration,
}

impl PollPolicy {
    /// Fixed interval between checks.
    pub fn constant(interval: Duration, max_wait: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            max_wait,
        }
    }

    /// Doubling interval, capped at `max_interval`.
    pub fn backoff(initial: Duration, max_interval: Duration, max_wait: Duration) -> Self {
        Self {
            initial_interval: initial,
            max_interval,
            max_wait,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

impl Default for PollPolicy {
    /// The defaults the original batch runs used: 5s checks, 10 minute cap.
    fn default() -> Self {
        PollPolicy::constant(Duration::from_secs(5), Duration::from_secs(600))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Polling
// ─────────────────────────────────────────────────────────────────────────────

/// Polls `fetch_state` until it reports a terminal state or the policy's
/// wait budget runs out.
///
/// `fetch_state` is called once per round; transport-level retries happen
/// below this layer, so any error it returns propagates immediately.
///
/// # Errors
///
/// - `AppError::PollTimeout` - budget exhausted while non-terminal; the
///   server-side job is left running, not aborted
pub async fn poll_until_done<F, Fut>(
    job_id: &str,
    policy: &PollPolicy,
    mut fetch_state: F,
) -> Result<TerminalState, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<BulkJobState, AppError>>,
{
    let started = Instant::now();
    let mut interval = policy.initial_interval;

    loop {
        let state = fetch_state().await?;

        if let Some(terminal) = TerminalState::from_state(state) {
            debug!(
                "[POLL] job {} terminal after {:?}: {:?}",
                redact_id(job_id),
                started.elapsed(),
                terminal
            );
            return Ok(terminal);
        }

        if started.elapsed() + interval > policy.max_wait {
            return Err(AppError::PollTimeout {
                job_id: job_id.to_string(),
                waited_secs: started.elapsed().as_secs(),
            });
        }

        debug!(
            "[POLL] job {} still {:?}, next check in {:?}",
            redact_id(job_id),
            state,
            interval
        );

        tokio::time::sleep(interval).await;
        interval = policy.next_interval(interval);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
