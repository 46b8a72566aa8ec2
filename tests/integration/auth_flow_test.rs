//! Integration tests for credential operations against the in-memory provider
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::test_harness::{client_with_account, empty_client, EventRecorder, EMAIL, PASSWORD};
use roster_auth::{AuthErrorKind, AuthEvent, IdentityProvider, Metadata, ProviderError, SessionState};

#[tokio::test]
async fn test_sign_in_publishes_exactly_one_notification() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    let mut recorder = EventRecorder::attach(&client);

    let session = client.sign_in(EMAIL, PASSWORD).await?;
    assert_eq!(session.state(), SessionState::Authenticated);

    let (event, notified) = recorder.next().await;
    assert_eq!(event, AuthEvent::SignedIn);
    assert_eq!(notified.user().map(|u| u.email.as_str()), Some(EMAIL));
    assert!(Arc::ptr_eq(&notified, &client.session()));

    // The provider's own SignedIn push must not produce a second one
    recorder.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_is_invalid_credentials() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    let mut recorder = EventRecorder::attach(&client);

    let err = client.sign_in(EMAIL, "wrong").await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::InvalidCredentials);
    assert!(!err.retryable());

    assert_eq!(client.session().state(), SessionState::Anonymous);
    assert!(client.session().user().is_none());
    recorder.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_sign_in_keeps_existing_session() -> Result<()> {
    let (provider, client) = client_with_account().await;
    let signed_in = client.sign_in(EMAIL, PASSWORD).await?;
    let mut recorder = EventRecorder::attach(&client);

    client.sign_in(EMAIL, "wrong").await.unwrap_err();
    provider.fail_next(ProviderError::Transport("connection reset".into()));
    let err = client.sign_in(EMAIL, PASSWORD).await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::NetworkUnavailable);

    assert!(Arc::ptr_eq(&client.session(), &signed_in));
    recorder.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn test_sign_up_stores_metadata() -> Result<()> {
    let (_provider, client) = empty_client();
    let mut recorder = EventRecorder::attach(&client);

    let mut metadata = Metadata::new();
    metadata.insert("name".to_string(), json!("X"));
    let user = client.sign_up("x@y.com", "secret", metadata).await?;
    assert_eq!(user.metadata_value("name"), Some(&json!("X")));

    let session = client.session();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(
        session.user().and_then(|u| u.metadata_value("name")),
        Some(&json!("X"))
    );

    assert_eq!(recorder.next_event().await, AuthEvent::SignedIn);
    recorder.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_sign_up_is_rejected() -> Result<()> {
    let (_provider, client) = client_with_account().await;

    let err = client
        .sign_up(EMAIL, "other", Metadata::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::InvalidCredentials);
    assert_eq!(client.session().state(), SessionState::Anonymous);
    Ok(())
}

#[tokio::test]
async fn test_sign_out_always_ends_anonymous() -> Result<()> {
    let (provider, client) = client_with_account().await;
    client.sign_in(EMAIL, PASSWORD).await?;
    let mut recorder = EventRecorder::attach(&client);

    provider.fail_next(ProviderError::Transport("network partition".into()));
    let err = client.sign_out().await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::NetworkUnavailable);
    assert!(err.retryable());

    let session = client.session();
    assert_eq!(session.state(), SessionState::Anonymous);
    assert!(session.user().is_none());
    assert_eq!(recorder.next_event().await, AuthEvent::SignedOut);

    // Signing out again while anonymous is still announced, once
    client.sign_out().await?;
    let (event, session) = recorder.next().await;
    assert_eq!(event, AuthEvent::SignedOut);
    assert_eq!(session.state(), SessionState::Anonymous);
    recorder.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn test_sign_out_from_anonymous_notifies_once() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    let mut recorder = EventRecorder::attach(&client);

    client.sign_out().await?;
    assert_eq!(recorder.next_event().await, AuthEvent::SignedOut);
    recorder.assert_quiet().await;
    assert_eq!(client.broadcast_stats().notifications_published, 1);
    Ok(())
}

#[tokio::test]
async fn test_subscriber_added_after_sign_in_sees_nothing() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    client.sign_in(EMAIL, PASSWORD).await?;

    let mut recorder = EventRecorder::attach(&client);
    recorder.assert_quiet().await;

    client.sign_out().await?;
    assert_eq!(recorder.next_event().await, AuthEvent::SignedOut);
    Ok(())
}

#[tokio::test]
async fn test_signing_in_again_is_announced_as_sign_in() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    let mut recorder = EventRecorder::attach(&client);

    let first = client.sign_in(EMAIL, PASSWORD).await?;
    let second = client.sign_in(EMAIL, PASSWORD).await?;
    assert_ne!(first.access_token(), second.access_token());

    assert_eq!(recorder.next_event().await, AuthEvent::SignedIn);
    assert_eq!(recorder.next_event().await, AuthEvent::SignedIn);
    recorder.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn test_get_current_user_round_trip() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    client.sign_in(EMAIL, PASSWORD).await?;

    let user = client.get_current_user().await?.expect("signed in user");
    assert_eq!(user.email, EMAIL);

    client.sign_out().await?;
    assert!(client.get_current_user().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_reads_reconcile_provider_revocation() -> Result<()> {
    let (provider, client) = client_with_account().await;
    client.sign_in(EMAIL, PASSWORD).await?;
    let mut recorder = EventRecorder::attach(&client);

    provider.revoke_current_session();
    assert!(client.get_current_user().await?.is_none());
    assert_eq!(client.session().state(), SessionState::Expired);
    assert_eq!(recorder.next_event().await, AuthEvent::SessionExpired);

    // Already expired, the session query has nothing to change
    let session = client.get_session().await?;
    assert_eq!(session.state(), SessionState::Expired);
    recorder.assert_quiet().await;

    // Expired --sign in--> Authenticated
    client.sign_in(EMAIL, PASSWORD).await?;
    assert_eq!(recorder.next_event().await, AuthEvent::SignedIn);
    Ok(())
}

#[tokio::test]
async fn test_reset_password_network_failure_is_retryable() -> Result<()> {
    let (provider, client) = client_with_account().await;

    provider.fail_next(ProviderError::Timeout(std::time::Duration::from_secs(5)));
    let err = client.reset_password(EMAIL).await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::NetworkUnavailable);
    assert!(err.retryable());

    client.reset_password(EMAIL).await?;
    assert_eq!(
        provider.reset_requests(),
        vec![(
            EMAIL.to_string(),
            "http://localhost:5173/reset-password".to_string()
        )]
    );
    assert_eq!(client.session().state(), SessionState::Anonymous);
    Ok(())
}

#[tokio::test]
async fn test_empty_input_is_rejected_without_provider_call() -> Result<()> {
    let (provider, client) = client_with_account().await;
    let calls = provider.call_count();

    let rejections = [
        client.sign_in("", PASSWORD).await.unwrap_err(),
        client.sign_in(EMAIL, "   ").await.unwrap_err(),
        client.sign_up(" \t", "pw", Metadata::new()).await.unwrap_err(),
        client.reset_password("").await.unwrap_err(),
        client.update_password("").await.unwrap_err(),
    ];
    for err in &rejections {
        assert_eq!(err.kind(), AuthErrorKind::InvalidCredentials);
        assert!(!err.retryable());
    }

    assert_eq!(provider.call_count(), calls);
    let stats = client.error_stats().await;
    assert_eq!(stats.total, rejections.len());
    Ok(())
}

#[tokio::test]
async fn test_update_password() -> Result<()> {
    let (_provider, client) = client_with_account().await;

    let err = client.update_password("new-secret").await.unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::SessionExpired);

    client.sign_in(EMAIL, PASSWORD).await?;
    let user = client.update_password("new-secret").await?;
    assert_eq!(user.email, EMAIL);
    assert_eq!(client.session().state(), SessionState::Authenticated);

    client.sign_out().await?;
    client.sign_in(EMAIL, PASSWORD).await.unwrap_err();
    client.sign_in(EMAIL, "new-secret").await?;
    Ok(())
}

#[tokio::test]
async fn test_unsubscribed_callback_sees_nothing() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let handle = client.subscribe(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let mut recorder = EventRecorder::attach(&client);

    assert!(client.unsubscribe(handle));
    assert!(!client.unsubscribe(handle));

    client.sign_in(EMAIL, PASSWORD).await?;
    assert_eq!(recorder.next_event().await, AuthEvent::SignedIn);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_initialize_picks_up_provider_session() -> Result<()> {
    let (provider, client) = client_with_account().await;
    provider.sign_in_with_password(EMAIL, PASSWORD).await?;

    let session = client.initialize().await?;
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.user().map(|u| u.email.as_str()), Some(EMAIL));
    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_overlapping_sign_in_and_sign_out_stay_consistent() -> Result<()> {
    let (_provider, client) = client_with_account().await;
    let client = Arc::new(client);

    for _ in 0..20 {
        let a = Arc::clone(&client);
        let b = Arc::clone(&client);
        let (signed_in, signed_out) = tokio::join!(
            tokio::spawn(async move { a.sign_in(EMAIL, PASSWORD).await }),
            tokio::spawn(async move { b.sign_out().await }),
        );
        signed_in?.map_err(anyhow::Error::new)?;
        signed_out?.map_err(anyhow::Error::new)?;

        let session = client.session();
        match session.state() {
            SessionState::Authenticated => assert!(session.user().is_some()),
            SessionState::Anonymous => assert!(session.user().is_none()),
            other => panic!("unexpected state {:?}", other),
        }
    }
    Ok(())
}
