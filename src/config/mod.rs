//! Environment-driven connection settings.
//!
//! Credentials and org endpoints come from the process environment,
//! optionally seeded from a dotenv file. Resolution order mirrors the
//! batch environment this tool runs in: an explicit `SF_ENV_FILE`, then
//! `.env`, `.env.local`, `.env.dev` — first file found wins, and existing
//! process variables are never overridden.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;
use url::Url;

use crate::error::AppError;

/// Default API version when `SF_API_VERSION` is unset.
const DEFAULT_API_VERSION: &str = "v62.0";

/// Dotenv candidates, in priority order after `SF_ENV_FILE`.
const ENV_FILE_CANDIDATES: &[&str] = &[".env", ".env.local", ".env.dev"];

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Connection settings for one org. Deliberately not `Debug`: the secret
/// must never end up in logs.
#[derive(Clone)]
pub struct Settings {
    /// Connected App consumer key.
    pub client_id: String,
    /// Connected App consumer secret. Never logged.
    pub client_secret: String,
    /// OAuth token endpoint.
    pub token_url: Url,
    /// Explicit instance URL override, if configured.
    pub instance_url: Option<Url>,
    /// API version path segment, normalized to a leading `v` (e.g. "v62.0").
    pub api_version: String,
}

// Manual `Debug` that redacts the secret, keeping the "never logged"
// guarantee while letting test helpers like `unwrap_err` format the value.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .field("instance_url", &self.instance_url)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl Settings {
    /// Loads settings from the process environment, after seeding it from
    /// the first dotenv file found.
    ///
    /// # Errors
    ///
    /// - `AppError::Config` - a required variable is missing or malformed
    pub fn from_env() -> Result<Self, AppError> {
        load_env_file();

        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::resolve(&vars)
    }

    /// Resolves settings from an explicit variable map.
    fn resolve(vars: &HashMap<String, String>) -> Result<Self, AppError> {
        let client_id = require(vars, "SF_CLIENT_ID")?;
        let client_secret = require(vars, "SF_CLIENT_SECRET")?;

        let token_url = match vars.get("SF_TOKEN_URL") {
            Some(raw) => parse_url("SF_TOKEN_URL", raw)?,
            None => {
                let domain = vars.get("SF_DOMAIN").ok_or_else(|| {
                    AppError::Config(
                        "Set SF_TOKEN_URL, or SF_DOMAIN to derive the token endpoint from".into(),
                    )
                })?;
                parse_url(
                    "SF_DOMAIN",
                    &format!("https://{}/services/oauth2/token", domain),
                )?
            }
        };

        let instance_url = vars
            .get("SF_INSTANCE_URL")
            .map(|raw| parse_url("SF_INSTANCE_URL", raw))
            .transpose()?;

        let api_version = normalize_api_version(
            vars.get("SF_API_VERSION")
                .map(String::as_str)
                .unwrap_or(DEFAULT_API_VERSION),
        );

        Ok(Settings {
            client_id,
            client_secret,
            token_url,
            instance_url,
            api_version,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Seeds the environment from the first dotenv file found. Missing files
/// are fine; this tool also runs with everything set by the scheduler.
fn load_env_file() {
    if let Ok(explicit) = std::env::var("SF_ENV_FILE") {
        if Path::new(&explicit).exists() {
            if dotenvy::from_path(&explicit).is_ok() {
                debug!("[CONFIG] env loaded from {}", explicit);
            }
            return;
        }
    }

    for candidate in ENV_FILE_CANDIDATES {
        if Path::new(candidate).exists() {
            if dotenvy::from_path(candidate).is_ok() {
                debug!("[CONFIG] env loaded from {}", candidate);
            }
            return;
        }
    }
}

fn require(vars: &HashMap<String, String>, name: &str) -> Result<String, AppError> {
    vars.get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| AppError::Config(format!("Missing required setting: {}", name)))
}

fn parse_url(name: &str, raw: &str) -> Result<Url, AppError> {
    Url::parse(raw).map_err(|e| AppError::Config(format!("Invalid {}: {}", name, e)))
}

/// Accepts "62.0", "v62.0", or "V62.0" and yields "v62.0".
fn normalize_api_version(raw: &str) -> String {
    let trimmed = raw.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    format!("v{}", bare)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
