//! Token Management
//!
//! Token persistence, the token endpoint client and refresh.

pub mod endpoint;
pub mod refresh;
pub mod storage;

pub use endpoint::TokenEndpointClient;
pub use refresh::{HttpTokenRefresher, MockTokenRefresher, TokenRefresher};
pub use storage::{
    FileTokenStore, InMemoryTokenStore, MockTokenStore, PersistedRecordEnvelope, TokenStore,
    ENVELOPE_FORMAT, ENVELOPE_VERSION,
};
