//! Integration test harness
//! Builds clients over the in-memory provider and records notifications

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use roster_auth::{AuthClient, AuthConfig, AuthEvent, IdentityProvider, InMemoryProvider, Metadata, Session};

pub const EMAIL: &str = "a@b.com";
pub const PASSWORD: &str = "pw";

/// Configuration that never touches the environment
pub fn test_config() -> AuthConfig {
    AuthConfig {
        provider_url: None,
        api_key: None,
        site_url: "http://localhost:5173".to_string(),
        reset_password_path: "/reset-password".to_string(),
        refresh_threshold_secs: 900,
        maintenance_interval_secs: 300,
        request_timeout_secs: 5,
        error_history: 50,
    }
}

fn client_for(provider: &Arc<InMemoryProvider>) -> AuthClient {
    AuthClient::new(
        Arc::clone(provider) as Arc<dyn IdentityProvider>,
        test_config(),
    )
}

/// Client and provider with no accounts
pub fn empty_client() -> (Arc<InMemoryProvider>, AuthClient) {
    let provider = Arc::new(InMemoryProvider::new());
    let client = client_for(&provider);
    (provider, client)
}

/// Client whose provider already knows `EMAIL`/`PASSWORD`. The account is
/// seeded before the client attaches, so the client starts out anonymous.
pub async fn client_with_account() -> (Arc<InMemoryProvider>, AuthClient) {
    let provider = Arc::new(InMemoryProvider::new());
    provider
        .sign_up(EMAIL, PASSWORD, &Metadata::new())
        .await
        .expect("seed account");
    provider.sign_out().await.expect("seed sign-out");

    let client = client_for(&provider);
    (provider, client)
}

/// Subscriber that collects every notification it receives
pub struct EventRecorder {
    rx: mpsc::UnboundedReceiver<(AuthEvent, Arc<Session>)>,
}

impl EventRecorder {
    pub fn attach(client: &AuthClient) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        client.subscribe(move |event, session| {
            tx.send((event, session))?;
            Ok(())
        });
        Self { rx }
    }

    /// Wait for the next notification
    pub async fn next(&mut self) -> (AuthEvent, Arc<Session>) {
        timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("recorder channel closed")
    }

    pub async fn next_event(&mut self) -> AuthEvent {
        self.next().await.0
    }

    /// Assert nothing else arrives within a short grace period
    pub async fn assert_quiet(&mut self) {
        sleep(Duration::from_millis(100)).await;
        if let Ok((event, _)) = self.rx.try_recv() {
            panic!("unexpected notification: {:?}", event);
        }
    }
}
