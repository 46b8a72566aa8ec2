use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

// Default configuration values
const DEFAULT_SITE_URL: &str = "http://localhost:5173";
const DEFAULT_RESET_PASSWORD_PATH: &str = "/reset-password";
const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 900; // 15 minutes
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300; // 5 minutes
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ERROR_HISTORY: usize = 100;
const MAX_REFRESH_THRESHOLD_SECS: u64 = 7 * 24 * 60 * 60; // 1 week

/// Configuration for the authentication session layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the GoTrue server; unset means the in-memory provider
    #[serde(default = "default_provider_url")]
    pub provider_url: Option<String>,
    /// Public (anon) API key sent with every provider request
    #[serde(default = "default_api_key")]
    pub api_key: Option<String>,
    /// Origin of the dashboard, used to build email links
    #[serde(default = "default_site_url")]
    pub site_url: String,
    /// Page the password reset email links back to
    #[serde(default = "default_reset_password_path")]
    pub reset_password_path: String,
    /// Refresh sessions that expire within this many seconds
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    /// How often session maintenance runs
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Timeout for a single provider request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Number of classified errors kept for diagnostics
    #[serde(default = "default_error_history")]
    pub error_history: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.parse().ok())
}

// Default functions
fn default_provider_url() -> Option<String> {
    std::env::var("ROSTER_AUTH_URL")
        .ok()
        .filter(|val| !val.trim().is_empty())
}

fn default_api_key() -> Option<String> {
    std::env::var("ROSTER_AUTH_ANON_KEY")
        .ok()
        .filter(|val| !val.trim().is_empty())
}

fn default_site_url() -> String {
    std::env::var("ROSTER_SITE_URL").unwrap_or_else(|_| DEFAULT_SITE_URL.to_string())
}

fn default_reset_password_path() -> String {
    DEFAULT_RESET_PASSWORD_PATH.to_string()
}

fn default_refresh_threshold() -> u64 {
    env_parse("ROSTER_REFRESH_THRESHOLD_SECS").unwrap_or(DEFAULT_REFRESH_THRESHOLD_SECS)
}

fn default_maintenance_interval() -> u64 {
    env_parse("ROSTER_MAINTENANCE_INTERVAL_SECS").unwrap_or(DEFAULT_MAINTENANCE_INTERVAL_SECS)
}

fn default_request_timeout() -> u64 {
    env_parse("ROSTER_REQUEST_TIMEOUT_SECS").unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
}

fn default_error_history() -> usize {
    DEFAULT_ERROR_HISTORY
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider_url: default_provider_url(),
            api_key: default_api_key(),
            site_url: default_site_url(),
            reset_password_path: default_reset_password_path(),
            refresh_threshold_secs: default_refresh_threshold(),
            maintenance_interval_secs: default_maintenance_interval(),
            request_timeout_secs: default_request_timeout(),
            error_history: default_error_history(),
        }
    }
}

impl AuthConfig {
    /// Where the password reset email sends the user
    pub fn password_reset_redirect(&self) -> String {
        format!(
            "{}{}",
            self.site_url.trim_end_matches('/'),
            self.reset_password_path
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Refresh threshold, capped at one week
    pub fn refresh_threshold(&self) -> chrono::TimeDelta {
        let secs = self.refresh_threshold_secs.min(MAX_REFRESH_THRESHOLD_SECS);
        chrono::TimeDelta::try_seconds(secs as i64).unwrap_or_else(chrono::TimeDelta::zero)
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        let site = reqwest::Url::parse(&self.site_url)
            .with_context(|| format!("invalid site_url: {}", self.site_url))?;
        if site.cannot_be_a_base() {
            bail!("site_url must be an absolute http(s) URL");
        }

        if let Some(url) = &self.provider_url {
            let parsed = reqwest::Url::parse(url)
                .with_context(|| format!("invalid provider_url: {}", url))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("provider_url must use http or https, got {}", parsed.scheme());
            }
        }

        if !self.reset_password_path.starts_with('/') {
            bail!("reset_password_path must start with '/'");
        }
        if self.refresh_threshold_secs > MAX_REFRESH_THRESHOLD_SECS {
            bail!(
                "refresh_threshold_secs must be at most {}",
                MAX_REFRESH_THRESHOLD_SECS
            );
        }
        if self.maintenance_interval_secs == 0 {
            bail!("maintenance_interval_secs must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

/// Load configuration from the environment, `.env`, and an optional JSON file.
///
/// `ROSTER_AUTH_CONFIG` names the JSON file; fields missing from it fall back to
/// the environment defaults.
pub async fn load_config() -> Result<AuthConfig> {
    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded environment from {}", path.display());
    }

    let config = match std::env::var("ROSTER_AUTH_CONFIG") {
        Ok(path) => load_config_file(Path::new(&path)).await?,
        Err(_) => AuthConfig::default(),
    };
    config.validate()?;

    info!(
        provider = config.provider_url.as_deref().unwrap_or("in-memory"),
        site_url = %config.site_url,
        "Loaded auth configuration"
    );
    Ok(config)
}

/// Read and validate a JSON configuration file
pub async fn load_config_file(path: &Path) -> Result<AuthConfig> {
    let config_str = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: AuthConfig = serde_json::from_str(&config_str)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
