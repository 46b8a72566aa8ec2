pub mod providers;
pub mod service;
pub mod session;
pub mod store;

pub use providers::{
    AuthResponse, GoTrueProvider, IdentityProvider, InMemoryProvider, ProviderAuthEvent,
    ProviderSession,
};
pub use service::AuthClient;
pub use session::{AuthEvent, Metadata, Session, SessionState, SessionTokens, User};
pub use store::SessionStore;
