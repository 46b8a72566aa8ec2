use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::providers::ProviderSession;
use crate::error::AuthError;

/// Free-form user metadata, passed through to the provider untouched
pub type Metadata = HashMap<String, Value>;

/// Identity record of an authenticated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Provider-assigned user identifier
    pub id: String,
    /// Email address the user signed up with
    pub email: String,
    /// Metadata supplied at sign-up (name, etc.)
    #[serde(default)]
    pub metadata: Metadata,
}

impl User {
    /// Get a metadata value by key
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Credentials backing an authenticated session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTokens {
    /// Opaque access token
    pub access_token: String,
    /// Token used to obtain a new access token
    pub refresh_token: Option<String>,
    /// When the access token stops being accepted
    pub expires_at: DateTime<Utc>,
}

impl SessionTokens {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Check if the token will expire within the given threshold
    pub fn expires_soon(&self, threshold: Duration) -> bool {
        self.expires_at - Utc::now() < threshold
    }

    pub fn seconds_until_expiration(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }
}

/// Lifecycle state of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Nobody is signed in
    Anonymous,
    /// Reserved for a sign-in handshake; credential operations never publish it
    Authenticating,
    /// Signed in with a live access token
    Authenticated,
    /// Signed in; the access token is being renewed
    Refreshing,
    /// The session ran out and could not be renewed
    Expired,
    /// The provider failed in a way that could not be recovered
    Error,
}

impl SessionState {
    /// States in which a user record must be present
    pub fn has_user(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Refreshing)
    }
}

/// Immutable snapshot of the authentication context.
///
/// A session is never edited in place: the store swaps in a new value on every
/// transition. The constructors keep `user` present exactly when the state is
/// `Authenticated` or `Refreshing`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    state: SessionState,
    user: Option<User>,
    tokens: Option<SessionTokens>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<AuthError>,
    generation: u64,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            state: SessionState::Anonymous,
            user: None,
            tokens: None,
            last_error: None,
            generation: 0,
        }
    }

    pub(crate) fn authenticated(user: User, tokens: SessionTokens) -> Self {
        Self {
            state: SessionState::Authenticated,
            user: Some(user),
            tokens: Some(tokens),
            last_error: None,
            generation: 0,
        }
    }

    pub(crate) fn expired() -> Self {
        Self {
            state: SessionState::Expired,
            ..Self::anonymous()
        }
    }

    pub(crate) fn errored(error: AuthError) -> Self {
        Self {
            state: SessionState::Error,
            last_error: Some(error),
            ..Self::anonymous()
        }
    }

    /// Build the session a provider handed back; stale tokens yield `Expired`
    pub(crate) fn from_provider(session: ProviderSession) -> Self {
        let tokens = SessionTokens {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            expires_at: session.expires_at,
        };
        if tokens.is_expired() {
            Self::expired()
        } else {
            Self::authenticated(session.user, tokens)
        }
    }

    /// Same user and tokens, marked as refreshing. Only meaningful for a
    /// session that currently holds a user.
    pub(crate) fn refreshing(&self) -> Self {
        match (&self.user, &self.tokens) {
            (Some(user), Some(tokens)) => Self {
                state: SessionState::Refreshing,
                user: Some(user.clone()),
                tokens: Some(tokens.clone()),
                last_error: None,
                generation: self.generation,
            },
            _ => Self::expired(),
        }
    }

    /// Same session with an updated user record
    pub(crate) fn with_user(&self, user: User) -> Self {
        Self {
            user: Some(user),
            ..self.clone()
        }
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Whether the session breaks the expiry invariant of a signed-in state
    pub(crate) fn is_stale(&self) -> bool {
        self.state.has_user() && self.tokens.as_ref().map_or(true, SessionTokens::is_expired)
    }

    /// Equality ignoring the store-assigned generation
    pub(crate) fn same_content(&self, other: &Session) -> bool {
        self.state == other.state
            && self.user == other.user
            && self.tokens == other.tokens
            && self.last_error == other.last_error
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn tokens(&self) -> Option<&SessionTokens> {
        self.tokens.as_ref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.tokens.as_ref().map(|t| t.expires_at)
    }

    pub fn last_error(&self) -> Option<&AuthError> {
        self.last_error.as_ref()
    }

    /// Number of replacements the store has made before this value
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.has_user()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Event tag delivered to subscribers alongside every new session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEvent {
    SigningIn,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    RefreshStarted,
    UserUpdated,
    SessionExpired,
    Failed,
}

impl AuthEvent {
    /// Derive the event tag for a transition between two sessions.
    ///
    /// Same-user `Authenticated` transitions read as `TokenRefreshed` or
    /// `UserUpdated`; a fresh sign-in by that user is tagged `SignedIn` by the
    /// store instead.
    pub fn from_transition(previous: &Session, next: &Session) -> Self {
        match next.state {
            SessionState::Anonymous => AuthEvent::SignedOut,
            SessionState::Refreshing => AuthEvent::RefreshStarted,
            SessionState::Expired => AuthEvent::SessionExpired,
            SessionState::Error => AuthEvent::Failed,
            SessionState::Authenticating => AuthEvent::SigningIn,
            SessionState::Authenticated => {
                let same_user = match (&previous.user, &next.user) {
                    (Some(a), Some(b)) => a.id == b.id,
                    _ => false,
                };
                if !same_user {
                    AuthEvent::SignedIn
                } else if previous.tokens != next.tokens {
                    AuthEvent::TokenRefreshed
                } else {
                    AuthEvent::UserUpdated
                }
            }
        }
    }
}
