use async_trait::async_trait;

use crate::AuthError;

/// A username/password check against some directory. `Ok(false)` is a wrong
/// credential, `Err` is a fault talking to the directory.
#[mockall::automock]
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError>;
}

/// True when the name resolves to a local account.
pub fn os_user_exists(username: &str) -> bool {
    matches!(nix::unistd::User::from_name(username), Ok(Some(_)))
}
