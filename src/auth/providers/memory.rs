//! In-process identity provider
//!
//! Keeps accounts and sessions in memory. Used for local runs of the dashboard
//! and for exercising the session layer without a network: failures can be
//! queued with `fail_next`, and provider-side events can be pushed with
//! `push_event`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AuthResponse, IdentityProvider, ListenerId, ProviderAuthEvent, ProviderListener,
    ProviderListeners, ProviderSession,
};
use crate::auth::session::{Metadata, User};
use crate::error::ProviderError;

const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone)]
struct Account {
    user: User,
    password: String,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity provider backed by in-memory tables
pub struct InMemoryProvider {
    /// Accounts keyed by email
    accounts: DashMap<String, Account>,
    /// Live refresh tokens mapped to the owning email
    refresh_tokens: DashMap<String, String>,
    current: Mutex<Option<ProviderSession>>,
    session_ttl: Duration,
    faults: Mutex<VecDeque<ProviderError>>,
    reset_requests: Mutex<Vec<(String, String)>>,
    calls: AtomicUsize,
    listeners: ProviderListeners,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::with_session_ttl(Duration::seconds(DEFAULT_SESSION_TTL_SECS))
    }

    /// Create a provider issuing sessions with the given lifetime
    pub fn with_session_ttl(session_ttl: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            refresh_tokens: DashMap::new(),
            current: Mutex::new(None),
            session_ttl,
            faults: Mutex::new(VecDeque::new()),
            reset_requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            listeners: ProviderListeners::new(),
        }
    }

    /// Make the next provider call fail with `error`
    pub fn fail_next(&self, error: ProviderError) {
        guard(&self.faults).push_back(error);
    }

    /// Number of boundary calls made so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Password reset requests as `(email, redirect_to)`
    pub fn reset_requests(&self) -> Vec<(String, String)> {
        guard(&self.reset_requests).clone()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Invalidate the current session on the provider side without telling anyone
    pub fn revoke_current_session(&self) {
        if let Some(session) = guard(&self.current).take() {
            if let Some(refresh_token) = session.refresh_token {
                self.refresh_tokens.remove(&refresh_token);
            }
        }
    }

    /// Raise a provider-side event, as a server push would
    pub fn push_event(&self, event: ProviderAuthEvent) {
        match &event {
            ProviderAuthEvent::SignedIn(session)
            | ProviderAuthEvent::TokenRefreshed(session)
            | ProviderAuthEvent::PasswordRecovery(session) => {
                *guard(&self.current) = Some(session.clone());
            }
            ProviderAuthEvent::SignedOut => {
                guard(&self.current).take();
            }
            ProviderAuthEvent::UserUpdated(_) => {}
        }
        self.listeners.emit(event);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Count the call and surface a queued fault, if any
    fn begin_call(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match guard(&self.faults).pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn issue_session(&self, user: User) -> ProviderSession {
        let refresh_token = format!("mem-rt-{}", Uuid::new_v4());
        self.refresh_tokens
            .insert(refresh_token.clone(), user.email.clone());

        let session = ProviderSession {
            access_token: format!("mem-at-{}", Uuid::new_v4()),
            refresh_token: Some(refresh_token),
            expires_at: Utc::now() + self.session_ttl,
            user,
        };

        // The replaced session's refresh token dies with it
        let previous = guard(&self.current).replace(session.clone());
        if let Some(old_token) = previous.and_then(|previous| previous.refresh_token) {
            self.refresh_tokens.remove(&old_token);
        }
        session
    }

    /// Number of refresh tokens that can still be exchanged
    pub fn live_refresh_tokens(&self) -> usize {
        self.refresh_tokens.len()
    }

    fn invalid_credentials() -> ProviderError {
        ProviderError::api(400, Some("invalid_credentials"), "Invalid login credentials")
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for InMemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &Metadata,
    ) -> Result<AuthResponse, ProviderError> {
        self.begin_call()?;

        if self.accounts.contains_key(email) {
            return Err(ProviderError::api(
                422,
                Some("user_already_exists"),
                "User already registered",
            ));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            metadata: metadata.clone(),
        };
        self.accounts.insert(
            email.to_string(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        info!(user_id = %user.id, "Created in-memory account");

        let session = self.issue_session(user.clone());
        self.listeners
            .emit(ProviderAuthEvent::SignedIn(session.clone()));

        Ok(AuthResponse {
            user,
            session: Some(session),
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ProviderError> {
        self.begin_call()?;

        let user = match self.accounts.get(email) {
            Some(account) if account.password == password => account.user.clone(),
            _ => return Err(Self::invalid_credentials()),
        };

        let session = self.issue_session(user.clone());
        self.listeners
            .emit(ProviderAuthEvent::SignedIn(session.clone()));

        Ok(AuthResponse {
            user,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.begin_call()?;
        self.revoke_current_session();
        self.listeners.emit(ProviderAuthEvent::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        self.begin_call()?;
        Ok(guard(&self.current).clone())
    }

    async fn get_user(&self) -> Result<Option<User>, ProviderError> {
        self.begin_call()?;
        let email = match guard(&self.current).as_ref() {
            Some(session) => session.user.email.clone(),
            None => return Ok(None),
        };
        Ok(self.accounts.get(&email).map(|account| account.user.clone()))
    }

    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<(), ProviderError> {
        self.begin_call()?;
        // Unknown addresses are accepted as well
        guard(&self.reset_requests).push((email.to_string(), redirect_to.to_string()));
        debug!(redirect_to, "Recorded password reset request");
        Ok(())
    }

    async fn update_user(&self, password: &str) -> Result<User, ProviderError> {
        self.begin_call()?;

        let email = match guard(&self.current).as_ref() {
            Some(session) => session.user.email.clone(),
            None => return Err(ProviderError::MissingSession),
        };

        let user = match self.accounts.get_mut(&email) {
            Some(mut account) => {
                if account.password == password {
                    return Err(ProviderError::api(
                        422,
                        Some("same_password"),
                        "New password should be different from the old password.",
                    ));
                }
                account.password = password.to_string();
                account.user.clone()
            }
            None => return Err(ProviderError::api(404, Some("user_not_found"), "User not found")),
        };

        self.listeners
            .emit(ProviderAuthEvent::UserUpdated(user.clone()));
        Ok(user)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<ProviderSession, ProviderError> {
        self.begin_call()?;

        let email = match self.refresh_tokens.remove(refresh_token) {
            Some((_, email)) => email,
            None => {
                return Err(ProviderError::api(
                    400,
                    Some("refresh_token_not_found"),
                    "Invalid Refresh Token: Refresh Token Not Found",
                ))
            }
        };
        let user = match self.accounts.get(&email) {
            Some(account) => account.user.clone(),
            None => return Err(ProviderError::api(404, Some("user_not_found"), "User not found")),
        };

        let session = self.issue_session(user);
        self.listeners
            .emit(ProviderAuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    fn on_auth_state_change(&self, listener: ProviderListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_auth_state_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}
