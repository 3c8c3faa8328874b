//! OAuth 2.0 Client Credentials token acquisition.
//!
//! Exchanges the configured consumer key/secret for an access token at the
//! org's token endpoint. The token and client secret are never logged.

use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::config::Settings;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Token endpoint success response. Extra fields are ignored.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    instance_url: Option<String>,
}

/// Token endpoint error response.
#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// A bearer token paired with the instance it authenticates against.
/// Deliberately not `Debug`: the token must never end up in logs.
#[derive(Clone)]
pub struct AuthenticatedSession {
    pub access_token: String,
    pub instance_url: Url,
}

// Manual `Debug` that redacts the token, keeping the "never logged"
// guarantee while letting test helpers like `unwrap_err` format the value.
impl std::fmt::Debug for AuthenticatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedSession")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token Acquisition
// ─────────────────────────────────────────────────────────────────────────────

/// Fetches an access token via the Client Credentials flow.
///
/// The instance URL is resolved in order of preference: the token
/// response's `instance_url`, the configured `SF_INSTANCE_URL`, and
/// finally the token endpoint's host.
///
/// # Errors
///
/// - `AppError::Auth` - credentials rejected by the token endpoint
/// - `AppError::Connection` - network failure
pub async fn fetch_token(
    http: &Arc<Client>,
    settings: &Settings,
) -> Result<AuthenticatedSession, AppError> {
    let params = [
        ("grant_type", "client_credentials"),
        ("client_id", settings.client_id.as_str()),
        ("client_secret", settings.client_secret.as_str()),
    ];

    info!("[AUTH] POST {} (client credentials)", settings.token_url.host_str().unwrap_or("?"));

    let response = http
        .post(settings.token_url.clone())
        .form(&params)
        .send()
        .await
        .map_err(|e| AppError::Connection(format!("Token request failed: {}", e)))?;

    let status = response.status();
    info!("[AUTH] POST /services/oauth2/token -> {}", status.as_u16());

    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Unable to read error body"));
        let detail = match serde_json::from_str::<TokenError>(&body) {
            Ok(err) => format!(
                "{}: {}",
                err.error,
                err.error_description.unwrap_or_default()
            ),
            Err(_) => format!("HTTP {}", status.as_u16()),
        };
        return Err(AppError::Auth(format!("Token rejected: {}", detail)));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| AppError::Auth(format!("Failed to parse token response: {}", e)))?;

    let instance_url = resolve_instance_url(
        token.instance_url.as_deref(),
        settings.instance_url.as_ref(),
        &settings.token_url,
    )?;

    Ok(AuthenticatedSession {
        access_token: token.access_token,
        instance_url,
    })
}

/// Picks the instance URL from the response, the settings, or the token host.
fn resolve_instance_url(
    from_response: Option<&str>,
    from_settings: Option<&Url>,
    token_url: &Url,
) -> Result<Url, AppError> {
    if let Some(raw) = from_response {
        return Url::parse(raw)
            .map_err(|e| AppError::Auth(format!("Invalid instance_url in token response: {}", e)));
    }
    if let Some(url) = from_settings {
        return Ok(url.clone());
    }
    let host = token_url
        .host_str()
        .ok_or_else(|| AppError::Config("Token URL has no host to derive an instance from".into()))?;
    Url::parse(&format!("https://{}", host))
        .map_err(|e| AppError::Internal(format!("Failed to derive instance URL: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
