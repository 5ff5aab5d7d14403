pub mod api_key;
pub mod audit_log;
pub mod auth;
pub mod claims;
pub mod clock;
pub mod token_cache;
pub mod token_store;
pub mod token_sweep;

pub use api_key::AuthMode;
pub use auth::{AuthError, IssuedToken, TokenIssuer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use token_store::{InMemoryTokenStore, TokenStore};
