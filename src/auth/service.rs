use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::auth::providers::{IdentityProvider, ListenerId, ProviderAuthEvent};
use crate::auth::session::{Metadata, Session, SessionState, User};
use crate::auth::store::SessionStore;
use crate::broadcast::{BroadcastStats, Broadcaster, Subscription};
use crate::config::AuthConfig;
use crate::error::{
    classify, AuthError, AuthErrorKind, AuthResult, ErrorRegistry, ErrorStats, ProviderError,
};

/// State shared between the client, the provider bridge and the maintenance task
struct Inner {
    provider: Arc<dyn IdentityProvider>,
    store: SessionStore,
    broadcaster: Arc<Broadcaster>,
    errors: ErrorRegistry,
    config: AuthConfig,
}

impl Inner {
    /// Classify, log and record a provider failure
    async fn fail(&self, operation: &'static str, err: &ProviderError) -> AuthError {
        let classified = classify(err);
        warn!(
            operation,
            provider = self.provider.name(),
            kind = %classified.kind(),
            retryable = classified.retryable(),
            error = %err,
            "Auth operation failed"
        );
        self.errors.record(&classified).await;
        classified
    }

    async fn reject(&self, operation: &'static str, message: &str) -> AuthError {
        let rejected = AuthError::invalid_input(message);
        debug!(operation, reason = message, "Rejected auth input");
        self.errors.record(&rejected).await;
        rejected
    }

    async fn require(&self, operation: &'static str, field: &str, value: &str) -> AuthResult<()> {
        if value.trim().is_empty() {
            return Err(self.reject(operation, &format!("{} must not be empty", field)).await);
        }
        Ok(())
    }

    /// Mirror a provider push event into the store
    fn bridge(&self, event: ProviderAuthEvent) {
        match event {
            ProviderAuthEvent::SignedIn(session) => {
                self.store.apply_sign_in(Session::from_provider(session));
            }
            ProviderAuthEvent::PasswordRecovery(session) => {
                self.store.apply(Session::from_provider(session));
            }
            ProviderAuthEvent::TokenRefreshed(session) => {
                // Only renew the session the store still holds; a refresh that lands
                // after a sign-out must not bring it back
                let current = self.store.snapshot();
                let same_user = current.user().map_or(false, |u| u.id == session.user.id);
                let next = Session::from_provider(session);
                if same_user && !current.same_content(&next) {
                    self.store.set_session_if(current.generation(), next);
                }
            }
            ProviderAuthEvent::UserUpdated(user) => {
                let current = self.store.snapshot();
                if current.user().map_or(false, |u| u.id == user.id) {
                    self.store.apply(current.with_user(user));
                }
            }
            ProviderAuthEvent::SignedOut => {
                self.store.apply(Session::anonymous());
            }
        }
    }

    /// Exchange the refresh token of the current session for a new one
    async fn refresh(&self) -> AuthResult<Arc<Session>> {
        const OP: &str = "refresh_session";

        let current = self.store.get_session();
        if !current.is_authenticated() {
            return Err(self.fail(OP, &ProviderError::MissingSession).await);
        }

        let refresh_token = match current.tokens().and_then(|t| t.refresh_token.clone()) {
            Some(token) => token,
            None => {
                self.store
                    .set_session_if(current.generation(), Session::expired());
                return Err(self.fail(OP, &ProviderError::MissingSession).await);
            }
        };

        let refreshing = if current.state() == SessionState::Refreshing {
            current
        } else {
            match self
                .store
                .set_session_if(current.generation(), current.refreshing())
            {
                Some(refreshing) => refreshing,
                None => return Err(superseded()),
            }
        };

        match self.provider.refresh_session(&refresh_token).await {
            Ok(session) => {
                let next = Session::from_provider(session);
                if let Some(stored) = self.store.set_session_if(refreshing.generation(), next.clone()) {
                    info!(expires_at = ?stored.expires_at(), "Session refreshed");
                    return Ok(stored);
                }

                // The provider's own notification may already have stored it
                let now = self.store.get_session();
                if now.same_content(&next) {
                    Ok(now)
                } else {
                    Err(superseded())
                }
            }
            Err(e) => {
                let classified = self.fail(OP, &e).await;
                let next = if classified.kind() == AuthErrorKind::Unknown {
                    Session::errored(classified.clone())
                } else {
                    Session::expired()
                };
                error!(
                    kind = %classified.kind(),
                    next_state = ?next.state(),
                    "Session refresh failed"
                );
                self.store.set_session_if(refreshing.generation(), next);
                Err(classified)
            }
        }
    }
}

fn superseded() -> AuthError {
    AuthError::new(AuthErrorKind::SessionExpired)
        .message("Session changed while it was being refreshed")
        .build()
}

/// Authentication client: credential operations over an identity provider,
/// with the resulting session kept in a store and broadcast to subscribers.
///
/// Must be created inside a Tokio runtime.
pub struct AuthClient {
    inner: Arc<Inner>,
    listener_id: ListenerId,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthClient {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: AuthConfig) -> Self {
        let broadcaster = Arc::new(Broadcaster::new());
        let inner = Arc::new(Inner {
            store: SessionStore::new(Arc::clone(&broadcaster)),
            errors: ErrorRegistry::new(config.error_history),
            provider,
            broadcaster,
            config,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let listener_id =
            inner
                .provider
                .on_auth_state_change(Arc::new(move |event: ProviderAuthEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.bridge(event);
                    }
                }));

        info!(provider = inner.provider.name(), "Auth client created");

        Self {
            inner,
            listener_id,
            maintenance_task: Mutex::new(None),
        }
    }

    /// Pick up any session the provider already holds and start session maintenance
    pub async fn initialize(&self) -> AuthResult<Arc<Session>> {
        let session = self.get_session().await?;
        self.start_session_maintenance();
        Ok(session)
    }

    /// Create an account. When the provider issues a session right away the user
    /// is signed in; when it waits for email confirmation the store is left alone.
    pub async fn sign_up(&self, email: &str, password: &str, metadata: Metadata) -> AuthResult<User> {
        const OP: &str = "sign_up";
        self.inner.require(OP, "email", email).await?;
        self.inner.require(OP, "password", password).await?;

        let response = match self
            .inner
            .provider
            .sign_up(email.trim(), password, &metadata)
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(self.inner.fail(OP, &e).await),
        };

        match response.session {
            Some(session) => {
                let stored = self.inner.store.apply_sign_in(Session::from_provider(session));
                info!(user_id = %response.user.id, state = ?stored.state(), "Signed up");
            }
            None => info!(user_id = %response.user.id, "Signed up, confirmation pending"),
        }
        Ok(response.user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<Arc<Session>> {
        const OP: &str = "sign_in";
        self.inner.require(OP, "email", email).await?;
        self.inner.require(OP, "password", password).await?;

        let response = match self
            .inner
            .provider
            .sign_in_with_password(email.trim(), password)
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(self.inner.fail(OP, &e).await),
        };

        let session = match response.session {
            Some(session) => session,
            None => {
                let err = ProviderError::Other("sign-in returned no session".to_string());
                return Err(self.inner.fail(OP, &err).await);
            }
        };

        let stored = self.inner.store.apply_sign_in(Session::from_provider(session));
        info!(user_id = %response.user.id, "Signed in");
        Ok(stored)
    }

    /// Sign out. The local session is cleared even when the provider call fails;
    /// the error is still returned since the remote session may be alive.
    /// Subscribers get exactly one `SignedOut`, whether or not the provider
    /// announced it as well.
    pub async fn sign_out(&self) -> AuthResult<()> {
        const OP: &str = "sign_out";
        let generation = self.inner.store.snapshot().generation();
        let result = self.inner.provider.sign_out().await;
        self.inner.store.clear_since(generation);

        match result {
            Ok(()) => {
                info!("Signed out");
                Ok(())
            }
            Err(e) => {
                let err = self.inner.fail(OP, &e).await;
                warn!("Signed out locally, provider did not confirm");
                Err(err)
            }
        }
    }

    /// Ask the provider to email a password reset link
    pub async fn reset_password(&self, email: &str) -> AuthResult<()> {
        const OP: &str = "reset_password";
        self.inner.require(OP, "email", email).await?;

        let redirect_to = self.inner.config.password_reset_redirect();
        match self
            .inner
            .provider
            .reset_password_for_email(email.trim(), &redirect_to)
            .await
        {
            Ok(()) => {
                info!(redirect_to = %redirect_to, "Password reset requested");
                Ok(())
            }
            Err(e) => Err(self.inner.fail(OP, &e).await),
        }
    }

    pub async fn update_password(&self, new_password: &str) -> AuthResult<User> {
        const OP: &str = "update_password";
        self.inner.require(OP, "password", new_password).await?;

        let user = match self.inner.provider.update_user(new_password).await {
            Ok(user) => user,
            Err(e) => return Err(self.inner.fail(OP, &e).await),
        };

        let current = self.inner.store.snapshot();
        if current.user().is_some() {
            self.inner.store.apply(current.with_user(user.clone()));
        }
        info!(user_id = %user.id, "Password updated");
        Ok(user)
    }

    /// Ask the provider who is signed in and reconcile the answer into the store
    pub async fn get_current_user(&self) -> AuthResult<Option<User>> {
        const OP: &str = "get_current_user";
        let user = match self.inner.provider.get_user().await {
            Ok(user) => user,
            Err(e) => return Err(self.inner.fail(OP, &e).await),
        };

        let current = self.inner.store.get_session();
        match &user {
            Some(user) => {
                let same_user = current.user().map_or(false, |u| u.id == user.id);
                if same_user {
                    self.inner.store.apply(current.with_user(user.clone()));
                }
            }
            None if current.is_authenticated() => {
                debug!("Provider has no user, expiring local session");
                self.inner.store.apply(Session::expired());
            }
            None => {}
        }
        Ok(user)
    }

    /// Ask the provider for its session and reconcile it into the store
    pub async fn get_session(&self) -> AuthResult<Arc<Session>> {
        const OP: &str = "get_session";
        let provided = match self.inner.provider.get_session().await {
            Ok(session) => session,
            Err(e) => return Err(self.inner.fail(OP, &e).await),
        };

        match provided {
            Some(session) => {
                self.inner.store.apply(Session::from_provider(session));
            }
            None if self.inner.store.get_session().is_authenticated() => {
                self.inner.store.apply(Session::expired());
            }
            None => {}
        }
        Ok(self.inner.store.get_session())
    }

    /// Current session as held locally; never waits on the provider
    pub fn session(&self) -> Arc<Session> {
        self.inner.store.get_session()
    }

    pub async fn refresh_session(&self) -> AuthResult<Arc<Session>> {
        self.inner.refresh().await
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(crate::auth::session::AuthEvent, Arc<Session>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.inner.broadcaster.subscribe(callback)
    }

    pub fn unsubscribe(&self, handle: Subscription) -> bool {
        self.inner.broadcaster.unsubscribe(handle)
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.inner.broadcaster.stats()
    }

    pub async fn error_stats(&self) -> ErrorStats {
        self.inner.errors.stats().await
    }

    pub fn provider_name(&self) -> &str {
        self.inner.provider.name()
    }

    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    /// Start the background task that refreshes sessions before they expire.
    /// Calling it again while the task runs has no effect.
    pub fn start_session_maintenance(&self) {
        let mut task = self
            .maintenance_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.maintenance_interval();
        let threshold = self.inner.config.refresh_threshold();

        info!(
            interval_secs = interval.as_secs(),
            threshold_secs = threshold.num_seconds(),
            "Starting session maintenance"
        );

        *task = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;

                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };

                // Reading forces Expired on a session that ran out
                let session = inner.store.get_session();
                let due = session.state() == SessionState::Authenticated
                    && session
                        .tokens()
                        .map_or(false, |tokens| tokens.expires_soon(threshold));

                if due {
                    debug!(
                        expires_in_secs = session.tokens().map(|t| t.seconds_until_expiration()),
                        "Session approaching expiration, refreshing"
                    );
                    if let Err(e) = inner.refresh().await {
                        warn!(error = %e, "Scheduled session refresh failed");
                    }
                }
            }
            debug!("Session maintenance stopped");
        }));
    }

    pub fn stop_session_maintenance(&self) {
        if let Some(handle) = self
            .maintenance_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            debug!("Session maintenance aborted");
        }
    }

    /// Stop maintenance, detach from the provider and drop every subscription.
    /// The store keeps its last value.
    pub fn shutdown(&self) {
        self.stop_session_maintenance();
        self.inner
            .provider
            .remove_auth_state_listener(self.listener_id);
        self.inner.broadcaster.clear();
        info!("Auth client shut down");
    }
}

impl Drop for AuthClient {
    fn drop(&mut self) {
        self.stop_session_maintenance();
        self.inner
            .provider
            .remove_auth_state_listener(self.listener_id);
    }
}
