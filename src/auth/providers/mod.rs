use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::auth::session::{Metadata, User};
use crate::error::ProviderError;

pub mod gotrue;
pub mod memory;

pub use gotrue::GoTrueProvider;
pub use memory::InMemoryProvider;

/// Session as issued by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

/// Result of a sign-up or password sign-in
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResponse {
    pub user: User,
    /// Absent when the provider still waits for email confirmation
    pub session: Option<ProviderSession>,
}

/// Push notification raised by the provider itself
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderAuthEvent {
    SignedIn(ProviderSession),
    SignedOut,
    TokenRefreshed(ProviderSession),
    UserUpdated(User),
    PasswordRecovery(ProviderSession),
}

/// Listener registered with `on_auth_state_change`
pub type ProviderListener = Arc<dyn Fn(ProviderAuthEvent) + Send + Sync>;

/// Handle for removing a provider listener
pub type ListenerId = Uuid;

/// Boundary to the external identity service.
///
/// Providers keep their own notion of the current session, the way a client SDK
/// does; the session store mirrors it.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &Metadata,
    ) -> Result<AuthResponse, ProviderError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;

    async fn get_session(&self) -> Result<Option<ProviderSession>, ProviderError>;

    async fn get_user(&self) -> Result<Option<User>, ProviderError>;

    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<(), ProviderError>;

    /// Change the password of the signed-in user
    async fn update_user(&self, password: &str) -> Result<User, ProviderError>;

    /// Exchange a refresh token for a new session
    async fn refresh_session(&self, refresh_token: &str) -> Result<ProviderSession, ProviderError>;

    /// Register a listener for provider-side state changes
    fn on_auth_state_change(&self, listener: ProviderListener) -> ListenerId;

    fn remove_auth_state_listener(&self, id: ListenerId);
}

/// Listener bookkeeping shared by the provider implementations
#[derive(Default)]
pub struct ProviderListeners {
    listeners: Mutex<Vec<(ListenerId, ProviderListener)>>,
}

impl ProviderListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: ProviderListener) -> ListenerId {
        let id = Uuid::new_v4();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(lid, _)| *lid != id);
    }

    /// Call every listener; the lock is released before any listener runs
    pub fn emit(&self, event: ProviderAuthEvent) {
        let listeners: Vec<ProviderListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        trace!(listeners = listeners.len(), event = ?event, "Emitting provider auth event");
        for listener in listeners {
            listener(event.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
