pub mod broker;
pub mod config;
pub mod cookies;
pub mod crypto;
pub mod error;
pub mod external;
pub mod google;
pub mod handlers;
pub mod keys;
pub mod lease;
pub mod local;
pub mod ldap;
pub mod oidc;
#[cfg(feature = "pam")]
pub mod pam;
pub mod password;
pub mod pkce;
pub mod redis_store;
pub mod reply;
pub mod session_store;
pub mod token;
pub mod user_db;
pub mod user_map;
pub mod verifier;

pub use broker::{AuthBroker, GuardedUser};
pub use error::AuthError;

/// Long lived refresh material, scoped to the auth path.
pub static REFRESH_COOKIE: &str = "Refresh-Token";
/// Upstream id token kept for `id_token_hint` on logout.
pub static LOGOUT_COOKIE: &str = "Logout-Token";
pub static OIDC_VERIFIER_COOKIE: &str = "oidcVerifier";
pub static OIDC_SESSION_COOKIE: &str = "oidcSession";
