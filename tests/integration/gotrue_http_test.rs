//! Integration tests for the GoTrue provider over a real HTTP round trip
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mockito::{Matcher, Server};
use serde_json::json;

use crate::test_harness::{test_config, EventRecorder};
use roster_auth::http_client::ReqwestHttpClient;
use roster_auth::{AuthClient, AuthErrorKind, AuthEvent, GoTrueProvider, SessionState};

const ANON_KEY: &str = "anon-key";
const USER_ID: &str = "8d0fd2b3-0000-4000-8000-000000000001";

fn client_for(base_url: &str) -> Result<AuthClient> {
    let http = ReqwestHttpClient::with_timeout(Duration::from_secs(2))?;
    let provider = GoTrueProvider::new(
        base_url,
        Some(ANON_KEY.to_string()),
        Arc::new(http),
        Duration::from_secs(2),
    );
    Ok(AuthClient::new(Arc::new(provider), test_config()))
}

fn user_body(name: &str) -> serde_json::Value {
    json!({
        "id": USER_ID,
        "email": "a@b.com",
        "user_metadata": { "name": name }
    })
}

fn token_body(access_token: &str) -> String {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": "rt-1",
        "user": user_body("A")
    })
    .to_string()
}

#[tokio::test]
async fn test_sign_in_user_and_sign_out() -> Result<()> {
    let mut server = Server::new_async().await;
    let token = server
        .mock("POST", "/token")
        .match_query(Matcher::UrlEncoded("grant_type".into(), "password".into()))
        .match_header("apikey", ANON_KEY)
        .match_body(Matcher::PartialJson(json!({ "email": "a@b.com", "password": "pw" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("at-1"))
        .create_async()
        .await;
    let user = server
        .mock("GET", "/user")
        .match_header("authorization", "Bearer at-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(user_body("A").to_string())
        .create_async()
        .await;
    let logout = server
        .mock("POST", "/logout")
        .match_header("authorization", "Bearer at-1")
        .with_status(204)
        .create_async()
        .await;

    let client = client_for(&server.url())?;
    let mut recorder = EventRecorder::attach(&client);

    let session = client.sign_in("a@b.com", "pw").await?;
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.access_token(), Some("at-1"));
    assert_eq!(recorder.next_event().await, AuthEvent::SignedIn);

    let current = client.get_current_user().await?.expect("user");
    assert_eq!(current.email, "a@b.com");
    recorder.assert_quiet().await;

    client.sign_out().await?;
    assert_eq!(recorder.next_event().await, AuthEvent::SignedOut);
    assert_eq!(client.session().state(), SessionState::Anonymous);

    token.assert_async().await;
    user.assert_async().await;
    logout.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_changed_profile_is_reconciled_as_user_update() -> Result<()> {
    let mut server = Server::new_async().await;
    let _token = server
        .mock("POST", "/token")
        .match_query(Matcher::UrlEncoded("grant_type".into(), "password".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("at-1"))
        .create_async()
        .await;
    let _user = server
        .mock("GET", "/user")
        .match_header("authorization", "Bearer at-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(user_body("Renamed").to_string())
        .create_async()
        .await;

    let client = client_for(&server.url())?;
    let mut recorder = EventRecorder::attach(&client);
    let signed_in = client.sign_in("a@b.com", "pw").await?;
    assert_eq!(recorder.next_event().await, AuthEvent::SignedIn);

    let current = client.get_current_user().await?.expect("user");
    assert_eq!(current.metadata_value("name"), Some(&json!("Renamed")));

    let (event, session) = recorder.next().await;
    assert_eq!(event, AuthEvent::UserUpdated);
    assert_eq!(
        session.user().and_then(|u| u.metadata_value("name")),
        Some(&json!("Renamed"))
    );
    assert_eq!(session.access_token(), signed_in.access_token());
    recorder.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_credentials_are_classified() -> Result<()> {
    let mut server = Server::new_async().await;
    let _token = server
        .mock("POST", "/token")
        .match_query(Matcher::UrlEncoded("grant_type".into(), "password".into()))
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "code": 400,
                "error_code": "invalid_credentials",
                "msg": "Invalid login credentials"
            })
            .to_string(),
        )
        .create_async()
        .await;
    let _rate_limited = server
        .mock("POST", "/recover")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "code": 429,
                "error_code": "over_email_send_rate_limit",
                "msg": "email rate limit exceeded"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = client_for(&server.url())?;

    let err = client.sign_in("a@b.com", "wrong").await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::InvalidCredentials);
    assert_eq!(err.message(), "Invalid login credentials");
    assert!(!err.retryable());
    assert_eq!(client.session().state(), SessionState::Anonymous);

    let err = client.reset_password("a@b.com").await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::RateLimited);
    assert!(err.retryable());
    Ok(())
}

#[tokio::test]
async fn test_reset_password_sends_redirect() -> Result<()> {
    let mut server = Server::new_async().await;
    let recover = server
        .mock("POST", "/recover")
        .match_query(Matcher::UrlEncoded(
            "redirect_to".into(),
            "http://localhost:5173/reset-password".into(),
        ))
        .match_body(Matcher::PartialJson(json!({ "email": "a@b.com" })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let client = client_for(&server.url())?;
    client.reset_password("a@b.com").await?;
    recover.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_server_is_network_unavailable() -> Result<()> {
    // Nothing listens on port 9 of the loopback interface
    let client = client_for("http://127.0.0.1:9")?;

    let err = client.sign_in("a@b.com", "pw").await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::NetworkUnavailable);
    assert!(err.retryable());
    assert_eq!(client.session().state(), SessionState::Anonymous);
    Ok(())
}
