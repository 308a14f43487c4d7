use async_trait::async_trait;

use crate::{password::PasswordAuthenticator, AuthError};

/// Checks credentials through the host's PAM stack.
pub struct PamAuthenticator {
    service: String,
}

impl PamAuthenticator {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl PasswordAuthenticator for PamAuthenticator {
    #[tracing::instrument(skip(self, password), err)]
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        let service = self.service.clone();
        let username = username.to_string();
        let password = password.to_string();
        // libpam blocks, sometimes for seconds on a failed attempt.
        tokio::task::spawn_blocking(move || {
            let mut authenticator = pam::Authenticator::with_password(&service)
                .map_err(|err| AuthError::Directory(format!("pam init failed: {err:?}")))?;
            authenticator
                .get_handler()
                .set_credentials(username.as_str(), password.as_str());
            Ok(authenticator.authenticate().is_ok())
        })
        .await
        .map_err(|err| AuthError::Internal(err.to_string()))?
    }
}
