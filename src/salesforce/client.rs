//! Authenticated HTTP transport for the Bulk API.
//!
//! Wraps a shared `reqwest::Client` with the instance base URL, the bearer
//! token, and the target API version. All bulk clients go through
//! [`SalesforceClient::send_with_retry`], which retries rate-limited and
//! transiently-failed requests with bounded exponential backoff. Every
//! other error is mapped to an [`AppError`] and returned unmodified.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::error::AppError;

/// Attempts per request before a transient failure is surfaced.
const MAX_ATTEMPTS: u32 = 4;

/// Initial backoff between retries.
const INITIAL_BACKOFF_MS: u64 = 500;

/// Backoff cap.
const MAX_BACKOFF_MS: u64 = 2_000;

/// Longest Retry-After the client will honor before giving up waiting.
const MAX_RETRY_AFTER_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Salesforce API error response format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SalesforceError {
    message: String,
    error_code: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SalesforceClient
// ─────────────────────────────────────────────────────────────────────────────

/// Shared transport handed to the ingest and query clients.
#[derive(Clone)]
pub struct SalesforceClient {
    /// Shared HTTP client.
    http: Arc<Client>,
    /// Base instance URL (e.g., "https://na1.salesforce.com").
    base_url: Url,
    /// Access token for authentication. Never logged.
    access_token: String,
    /// API version path segment (e.g., "v62.0").
    api_version: String,
}

impl SalesforceClient {
    /// Creates a new transport.
    pub fn new(http: Arc<Client>, base_url: Url, access_token: String, api_version: String) -> Self {
        Self {
            http,
            base_url,
            access_token,
            api_version,
        }
    }

    /// Joins a path under `/services/data/{version}/`.
    pub fn api_url(&self, path: &str) -> Result<Url, AppError> {
        let full = format!("/services/data/{}/{}", self.api_version, path);
        self.base_url
            .join(&full)
            .map_err(|e| AppError::Internal(format!("Failed to build URL for {}: {}", path, e)))
    }

    /// Starts a request with the bearer token applied.
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    /// Sends a request, retrying rate limits and connection failures.
    ///
    /// `build` is invoked once per attempt because a `RequestBuilder` is
    /// consumed by `send`. Responses with non-success statuses other than
    /// 429 are mapped by [`parse_error_response`] and returned without
    /// retry. Requests with streaming bodies must not go through here —
    /// they cannot be rebuilt (see `BulkIngestClient::upload_batch`).
    pub async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<Response, AppError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = build().send().await;

            let error = match result {
                Ok(response) if response.status() != StatusCode::TOO_MANY_REQUESTS => {
                    return Ok(response);
                }
                Ok(response) => {
                    let retry_after = retry_after_secs(&response);
                    AppError::RateLimited {
                        retry_after_secs: retry_after,
                    }
                }
                Err(e) => AppError::Connection(format!("{}: {}", label, e)),
            };

            if attempt == MAX_ATTEMPTS {
                return Err(error);
            }

            let wait = match &error {
                AppError::RateLimited {
                    retry_after_secs: Some(secs),
                } if *secs <= MAX_RETRY_AFTER_SECS => Duration::from_secs(*secs),
                _ => Duration::from_millis(backoff_ms),
            };

            warn!(
                "[HTTP] {} attempt {}/{} failed ({}), retrying in {:?}",
                label, attempt, MAX_ATTEMPTS, error, wait
            );

            tokio::time::sleep(wait).await;
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
        }

        unreachable!("retry loop returns on the last attempt")
    }

    /// Convenience wrapper: send, log the status, and map non-success
    /// responses to an error.
    pub async fn execute<F>(&self, label: &str, build: F) -> Result<Response, AppError>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = self.send_with_retry(label, build).await?;
        let status = response.status();
        info!("[HTTP] {} -> {}", label, status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        Ok(response)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Maps a non-success response to the appropriate `AppError`.
pub(crate) async fn parse_error_response(response: Response, status: StatusCode) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after_secs(&response);
        return AppError::RateLimited {
            retry_after_secs: retry_after,
        };
    }

    if status == StatusCode::NOT_FOUND {
        return AppError::NotFound("Bulk job not found".to_string());
    }

    let auth_rejected =
        status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("Unable to read error body"));

    if let Ok(errors) = serde_json::from_str::<Vec<SalesforceError>>(&body) {
        if let Some(first_error) = errors.first() {
            if first_error.error_code == "REQUEST_LIMIT_EXCEEDED" {
                return AppError::RateLimited {
                    retry_after_secs: None,
                };
            }

            let message = format!("[{}] {}", first_error.error_code, first_error.message);
            if auth_rejected {
                return AppError::Auth(message);
            }
            return AppError::Request {
                status: status.as_u16(),
                message,
            };
        }
    }

    if auth_rejected {
        return AppError::Auth(format!("HTTP {}", status.as_u16()));
    }

    AppError::Request {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string(),
    }
}

/// Reads the Retry-After header as whole seconds.
fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
