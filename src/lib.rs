//! Authentication session layer for the staff roster dashboard.
//!
//! [`AuthClient`] runs credential operations against an [`IdentityProvider`],
//! keeps the resulting [`Session`] in a [`SessionStore`] and broadcasts every
//! transition to subscribers. Provider failures come back as a classified
//! [`AuthError`].

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{
    AuthClient, AuthEvent, GoTrueProvider, IdentityProvider, InMemoryProvider, Metadata, Session,
    SessionState, SessionStore, User,
};
pub use broadcast::{BroadcastStats, Broadcaster, Subscription};
pub use config::{load_config, AuthConfig};
pub use error::{classify, AuthError, AuthErrorKind, AuthResult, ErrorStats, ProviderError};
