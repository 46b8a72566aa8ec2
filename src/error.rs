use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Failure reported by an identity provider, in the provider's own shape
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The provider answered with an error response
    #[error("identity provider returned {status}: {message}")]
    Api {
        /// HTTP status code (0 when the provider is not HTTP based)
        status: u16,
        /// Machine-readable error code, when the provider sends one
        code: Option<String>,
        /// Human-readable message
        message: String,
    },

    /// The request never reached the provider or the connection dropped
    #[error("could not reach identity provider: {0}")]
    Transport(String),

    /// The provider did not answer within the configured timeout
    #[error("identity provider request timed out after {0:?}")]
    Timeout(Duration),

    /// The call needs an active session and the provider has none
    #[error("no active session")]
    MissingSession,

    /// Anything the provider could not describe more precisely
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Create an API error
    pub fn api(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        ProviderError::Api {
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Stable taxonomy every provider failure is normalized into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AuthErrorKind {
    InvalidCredentials,
    NetworkUnavailable,
    RateLimited,
    SessionExpired,
    Unknown,
}

impl AuthErrorKind {
    /// Only transient failures are worth retrying automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable | Self::RateLimited)
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::NetworkUnavailable => "network_unavailable",
            Self::RateLimited => "rate_limited",
            Self::SessionExpired => "session_expired",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Normalized failure returned by every credential operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthError {
    kind: AuthErrorKind,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
}

impl AuthError {
    pub(crate) fn new(kind: AuthErrorKind) -> AuthErrorBuilder {
        AuthErrorBuilder {
            kind,
            message: String::new(),
            context: None,
        }
    }

    /// Error for input rejected before reaching the provider
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidCredentials)
            .message(message)
            .context("rejected locally")
            .build()
    }

    pub fn kind(&self) -> AuthErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }
        Ok(())
    }
}

impl std::error::Error for AuthError {}

/// Builder for AuthError; `retryable` always follows the kind
pub(crate) struct AuthErrorBuilder {
    kind: AuthErrorKind,
    message: String,
    context: Option<String>,
}

impl AuthErrorBuilder {
    pub(crate) fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub(crate) fn build(self) -> AuthError {
        AuthError {
            retryable: self.kind.is_retryable(),
            kind: self.kind,
            message: self.message,
            context: self.context,
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

const RATE_LIMIT_CODES: &[&str] = &[
    "over_request_rate_limit",
    "over_email_send_rate_limit",
    "over_sms_send_rate_limit",
];

const CREDENTIAL_CODES: &[&str] = &[
    "invalid_credentials",
    "invalid_grant",
    "user_not_found",
    "user_already_exists",
    "email_exists",
    "weak_password",
    "same_password",
    "validation_failed",
    "email_address_invalid",
];

const SESSION_CODES: &[&str] = &[
    "session_not_found",
    "session_expired",
    "refresh_token_not_found",
    "refresh_token_already_used",
    "bad_jwt",
    "no_authorization",
];

/// Map a provider failure onto the fixed taxonomy
pub fn classify(err: &ProviderError) -> AuthError {
    match err {
        ProviderError::Transport(reason) => AuthError::new(AuthErrorKind::NetworkUnavailable)
            .message("Identity provider is unreachable")
            .context(reason.clone())
            .build(),

        ProviderError::Timeout(after) => AuthError::new(AuthErrorKind::NetworkUnavailable)
            .message("Identity provider did not respond in time")
            .context(format!("timed out after {}ms", after.as_millis()))
            .build(),

        ProviderError::MissingSession => AuthError::new(AuthErrorKind::SessionExpired)
            .message("No active session")
            .build(),

        ProviderError::Api {
            status,
            code,
            message,
        } => {
            let kind = classify_api(*status, code.as_deref(), message);
            let context = match code {
                Some(code) => format!("status {}, code {}", status, code),
                None => format!("status {}", status),
            };
            AuthError::new(kind)
                .message(message.clone())
                .context(context)
                .build()
        }

        ProviderError::Other(message) => AuthError::new(classify_message(message))
            .message(message.clone())
            .build(),
    }
}

fn classify_api(status: u16, code: Option<&str>, message: &str) -> AuthErrorKind {
    if let Some(code) = code {
        if RATE_LIMIT_CODES.contains(&code) {
            return AuthErrorKind::RateLimited;
        }
        if CREDENTIAL_CODES.contains(&code) {
            return AuthErrorKind::InvalidCredentials;
        }
        if SESSION_CODES.contains(&code) {
            return AuthErrorKind::SessionExpired;
        }
    }

    match status {
        0 | 502 | 503 | 504 => AuthErrorKind::NetworkUnavailable,
        429 => AuthErrorKind::RateLimited,
        401 if code.is_none() => AuthErrorKind::SessionExpired,
        400 if message.to_lowercase().contains("invalid login credentials") => {
            AuthErrorKind::InvalidCredentials
        }
        _ => AuthErrorKind::Unknown,
    }
}

fn classify_message(message: &str) -> AuthErrorKind {
    let msg = message.to_lowercase();
    if msg.contains("timed out") || msg.contains("timeout") || msg.contains("network") {
        AuthErrorKind::NetworkUnavailable
    } else if msg.contains("rate limit") || msg.contains("too many requests") {
        AuthErrorKind::RateLimited
    } else if msg.contains("invalid login credentials") {
        AuthErrorKind::InvalidCredentials
    } else if msg.contains("jwt expired") || msg.contains("session expired") {
        AuthErrorKind::SessionExpired
    } else {
        AuthErrorKind::Unknown
    }
}

/// Counts and recent history of classified errors
#[derive(Debug)]
pub struct ErrorRegistry {
    counts: RwLock<HashMap<AuthErrorKind, usize>>,
    history: RwLock<VecDeque<AuthError>>,
    max_history: usize,
}

/// Snapshot of the error registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub by_kind: HashMap<AuthErrorKind, usize>,
    pub recent: Vec<AuthError>,
}

impl ErrorRegistry {
    pub fn new(max_history: usize) -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(max_history)),
            max_history,
        }
    }

    /// Record an error occurrence
    pub async fn record(&self, error: &AuthError) {
        *self.counts.write().await.entry(error.kind()).or_insert(0) += 1;

        let mut history = self.history.write().await;
        history.push_back(error.clone());
        while history.len() > self.max_history {
            history.pop_front();
        }

        debug!(kind = %error.kind(), retryable = error.retryable(), "Recorded auth error");
    }

    pub async fn count(&self, kind: AuthErrorKind) -> usize {
        self.counts.read().await.get(&kind).copied().unwrap_or(0)
    }

    pub async fn stats(&self) -> ErrorStats {
        let by_kind = self.counts.read().await.clone();
        ErrorStats {
            total: by_kind.values().sum(),
            by_kind,
            recent: self.history.read().await.iter().cloned().collect(),
        }
    }

    pub async fn clear(&self) {
        self.counts.write().await.clear();
        self.history.write().await.clear();
    }
}
