use std::sync::Arc;

use anyhow::Result;
use roster_auth::{
    load_config, AuthClient, GoTrueProvider, IdentityProvider, InMemoryProvider, Metadata,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_EMAIL: &str = "demo@roster.local";
const DEMO_PASSWORD: &str = "correct horse battery staple";

#[tokio::main]
async fn main() -> Result<()> {
    let env_file_path = dotenvy::dotenv().ok();

    // Initialize the tracing subscriber for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "roster_auth=debug,session_demo=debug,warn".into()
            } else {
                "roster_auth=info,session_demo=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let config = load_config().await?;
    let provider: Arc<dyn IdentityProvider> = match config.provider_url {
        Some(_) => {
            let provider = GoTrueProvider::from_config(&config)?;
            info!(url = provider.base_url(), "Using the GoTrue provider");
            Arc::new(provider)
        }
        None => {
            warn!("ROSTER_AUTH_URL is not set, using the in-memory provider");
            Arc::new(InMemoryProvider::new())
        }
    };

    let client = AuthClient::new(provider, config);
    let logger = client.subscribe(|event, session| {
        info!(
            event = ?event,
            state = ?session.state(),
            user = session.user().map(|u| u.email.as_str()).unwrap_or("-"),
            "Session changed"
        );
        Ok(())
    });
    debug!(subscription_id = %logger.id(), "Logging session changes");

    let initial = client.initialize().await;
    match &initial {
        Ok(session) => info!(state = ?session.state(), "Client initialized"),
        Err(e) => error!(error = %e, "Could not read the provider session"),
    }

    let email = std::env::var("ROSTER_DEMO_EMAIL").unwrap_or_else(|_| DEMO_EMAIL.to_string());
    let password =
        std::env::var("ROSTER_DEMO_PASSWORD").unwrap_or_else(|_| DEMO_PASSWORD.to_string());

    let mut metadata = Metadata::new();
    metadata.insert("name".to_string(), serde_json::json!("Demo User"));
    if let Err(e) = client.sign_up(&email, &password, metadata).await {
        warn!(error = %e, "Sign-up failed, trying sign-in");
    }

    match client.sign_in(&email, &password).await {
        Ok(session) => info!(expires_at = ?session.expires_at(), "Signed in"),
        Err(e) => error!(error = %e, "Sign-in failed"),
    }

    // A wrong password is classified rather than raised
    if let Err(e) = client.sign_in(&email, "not the password").await {
        info!(kind = %e.kind(), retryable = e.retryable(), "Wrong password rejected");
    }

    match client.get_current_user().await {
        Ok(Some(user)) => info!(user_id = %user.id, email = %user.email, "Current user"),
        Ok(None) => info!("Nobody is signed in"),
        Err(e) => error!(error = %e, "Could not fetch the current user"),
    }

    if let Err(e) = client.sign_out().await {
        warn!(error = %e, "Provider did not confirm sign-out");
    }

    // Let the dispatcher drain before reporting
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    info!(
        stats = %serde_json::to_string(&client.broadcast_stats())?,
        errors = %serde_json::to_string(&client.error_stats().await)?,
        "Demo finished"
    );
    client.shutdown();
    Ok(())
}
