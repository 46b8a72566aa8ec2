//! GoTrue (Supabase Auth) REST provider
//!
//! Talks to a GoTrue server over [`HttpClient`] and keeps the current session in
//! memory the way the JavaScript client does. Error bodies come in two shapes,
//! `{"error_code", "msg"}` on current servers and `{"error", "error_description"}`
//! on the OAuth-style token endpoint of older ones; both end up in
//! [`ProviderError::Api`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    AuthResponse, IdentityProvider, ListenerId, ProviderAuthEvent, ProviderListener,
    ProviderListeners, ProviderSession,
};
use crate::auth::session::{Metadata, User};
use crate::config::AuthConfig;
use crate::error::ProviderError;
use crate::http_client::{self, HttpClient, HttpMethod, ReqwestHttpClient, SimpleHttpResponse};

/// Lifetime assumed when the server reports neither `expires_at` nor `expires_in`
const FALLBACK_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Metadata,
}

impl From<GoTrueUser> for User {
    fn from(user: GoTrueUser) -> Self {
        User {
            id: user.id,
            email: user.email.unwrap_or_default(),
            metadata: user.user_metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: GoTrueUser,
}

impl TryFrom<TokenResponse> for ProviderSession {
    type Error = ProviderError;

    fn try_from(token: TokenResponse) -> Result<Self, Self::Error> {
        let expires_at = match token
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            Some(expires_at) => expires_at,
            None => {
                let expires_in = token.expires_in.unwrap_or(FALLBACK_EXPIRES_IN_SECS);
                TimeDelta::try_seconds(expires_in)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        ProviderError::Other(format!("session lifetime out of range: {}s", expires_in))
                    })?
            }
        };

        Ok(ProviderSession {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
            user: token.user.into(),
        })
    }
}

/// `/signup` answers with a session, or with the bare user while email
/// confirmation is pending
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(GoTrueUser),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

fn api_error(response: &SimpleHttpResponse) -> ProviderError {
    let status = response.status();
    let body: ErrorBody = response.json().unwrap_or_default();

    let code = body.error_code.or_else(|| body.error.clone());
    let message = body
        .msg
        .or(body.message)
        .or(body.error_description)
        .or(body.error)
        .unwrap_or_else(|| {
            let text = response.body().trim();
            if text.is_empty() {
                format!("HTTP {}", status)
            } else {
                text.to_string()
            }
        });

    ProviderError::Api {
        status,
        code,
        message,
    }
}

fn parse<T: serde::de::DeserializeOwned>(response: &SimpleHttpResponse) -> Result<T, ProviderError> {
    response
        .json()
        .map_err(|e| ProviderError::Other(format!("unexpected response from identity provider: {}", e)))
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity provider backed by a GoTrue server
pub struct GoTrueProvider {
    base_url: String,
    api_key: Option<String>,
    http: Arc<dyn HttpClient>,
    timeout: Duration,
    current: Mutex<Option<ProviderSession>>,
    listeners: ProviderListeners,
}

impl GoTrueProvider {
    /// Create a provider for the GoTrue server at `base_url` (e.g. `https://x.supabase.co/auth/v1`)
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        http: Arc<dyn HttpClient>,
        timeout: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key,
            http,
            timeout,
            current: Mutex::new(None),
            listeners: ProviderListeners::new(),
        }
    }

    /// Build a provider with a reqwest transport from configuration
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let base_url = config
            .provider_url
            .clone()
            .ok_or_else(|| anyhow!("provider_url is not configured"))?;
        let http = ReqwestHttpClient::with_timeout(config.request_timeout())?;

        Ok(Self::new(
            base_url,
            config.api_key.clone(),
            Arc::new(http),
            config.request_timeout(),
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn headers(&self, bearer: Option<&str>) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if let Some(key) = &self.api_key {
            headers.insert("apikey".to_string(), key.clone());
        }
        if let Some(token) = bearer.or(self.api_key.as_deref()) {
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }
        headers
    }

    /// Send one request, mapping transport failures and timeouts. Non-2xx
    /// responses are returned as `ProviderError::Api`.
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> Result<SimpleHttpResponse, ProviderError> {
        let headers = self.headers(bearer);
        let body = body.map(|b| b.to_string()).unwrap_or_default();

        let call = async {
            match method {
                HttpMethod::GET => self.http.get(url, headers).await,
                HttpMethod::POST => self.http.post(url, headers, body).await,
                HttpMethod::PUT => self.http.put(url, headers, body).await,
            }
        };

        let response = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => return Err(ProviderError::Timeout(self.timeout)),
            Ok(Err(e)) if http_client::is_timeout(&e) => {
                return Err(ProviderError::Timeout(self.timeout))
            }
            Ok(Err(e)) => return Err(ProviderError::Transport(format!("{:#}", e))),
            Ok(Ok(response)) => response,
        };

        debug!(method = ?method, status = response.status(), "GoTrue request finished");
        if response.is_success() {
            Ok(response)
        } else {
            Err(api_error(&response))
        }
    }

    fn current(&self) -> Option<ProviderSession> {
        guard(&self.current).clone()
    }

    fn store_session(&self, session: Option<ProviderSession>) {
        *guard(&self.current) = session;
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<ProviderSession, ProviderError> {
        let url = self.endpoint(&format!("/token?grant_type={}", grant_type));
        let response = self.request(HttpMethod::POST, &url, None, Some(body)).await?;
        let token: TokenResponse = parse(&response)?;
        ProviderSession::try_from(token)
    }
}

#[async_trait]
impl IdentityProvider for GoTrueProvider {
    fn name(&self) -> &str {
        "gotrue"
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &Metadata,
    ) -> Result<AuthResponse, ProviderError> {
        let body = json!({ "email": email, "password": password, "data": metadata });
        let response = self
            .request(HttpMethod::POST, &self.endpoint("/signup"), None, Some(body))
            .await?;

        match parse::<SignUpResponse>(&response)? {
            SignUpResponse::Session(token) => {
                let session = ProviderSession::try_from(token)?;
                self.store_session(Some(session.clone()));
                self.listeners
                    .emit(ProviderAuthEvent::SignedIn(session.clone()));
                Ok(AuthResponse {
                    user: session.user.clone(),
                    session: Some(session),
                })
            }
            SignUpResponse::User(user) => {
                info!("Sign-up accepted, email confirmation pending");
                Ok(AuthResponse {
                    user: user.into(),
                    session: None,
                })
            }
        }
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ProviderError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;

        self.store_session(Some(session.clone()));
        self.listeners
            .emit(ProviderAuthEvent::SignedIn(session.clone()));
        Ok(AuthResponse {
            user: session.user.clone(),
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        if let Some(session) = self.current() {
            let result = self
                .request(
                    HttpMethod::POST,
                    &self.endpoint("/logout"),
                    Some(&session.access_token),
                    None,
                )
                .await;

            match result {
                Ok(_) => {}
                // Server already dropped the session
                Err(ProviderError::Api { status, .. }) if matches!(status, 401 | 403 | 404) => {
                    debug!(status, "Server-side session already gone");
                }
                Err(e) => return Err(e),
            }
        }

        self.store_session(None);
        self.listeners.emit(ProviderAuthEvent::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        let session = match self.current() {
            Some(session) => session,
            None => return Ok(None),
        };
        if session.expires_at > Utc::now() {
            return Ok(Some(session));
        }

        match session.refresh_token.clone() {
            Some(refresh_token) => self.refresh_session(&refresh_token).await.map(Some),
            None => {
                self.store_session(None);
                Ok(None)
            }
        }
    }

    async fn get_user(&self) -> Result<Option<User>, ProviderError> {
        let session = match self.current() {
            Some(session) => session,
            None => return Ok(None),
        };

        let response = self
            .request(
                HttpMethod::GET,
                &self.endpoint("/user"),
                Some(&session.access_token),
                None,
            )
            .await?;
        let user: GoTrueUser = parse(&response)?;
        Ok(Some(user.into()))
    }

    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<(), ProviderError> {
        let url = reqwest::Url::parse_with_params(
            &self.endpoint("/recover"),
            &[("redirect_to", redirect_to)],
        )
        .map_err(|e| ProviderError::Other(format!("invalid recover URL: {}", e)))?;

        self.request(HttpMethod::POST, url.as_str(), None, Some(json!({ "email": email })))
            .await?;
        Ok(())
    }

    async fn update_user(&self, password: &str) -> Result<User, ProviderError> {
        let session = self.current().ok_or(ProviderError::MissingSession)?;

        let response = self
            .request(
                HttpMethod::PUT,
                &self.endpoint("/user"),
                Some(&session.access_token),
                Some(json!({ "password": password })),
            )
            .await?;
        let user: User = parse::<GoTrueUser>(&response)?.into();

        {
            let mut current = guard(&self.current);
            if let Some(current) = current.as_mut() {
                current.user = user.clone();
            }
        }
        self.listeners
            .emit(ProviderAuthEvent::UserUpdated(user.clone()));
        Ok(user)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<ProviderSession, ProviderError> {
        let result = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await;

        match result {
            Ok(session) => {
                self.store_session(Some(session.clone()));
                self.listeners
                    .emit(ProviderAuthEvent::TokenRefreshed(session.clone()));
                Ok(session)
            }
            Err(e) => {
                if matches!(e, ProviderError::Api { status: 400..=499, .. }) {
                    warn!(error = %e, "Refresh token rejected, dropping session");
                    self.store_session(None);
                }
                Err(e)
            }
        }
    }

    fn on_auth_state_change(&self, listener: ProviderListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_auth_state_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}
