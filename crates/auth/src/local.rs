use std::sync::Arc;

use crate::{
    config::{SiteConfig, TokenAges},
    cookies::{auth_cookie, clear_cookie},
    password::{os_user_exists, PasswordAuthenticator},
    reply::{AuthReply, TokenGrant},
    token::{TokenCodec, TokenKind},
    AuthError, REFRESH_COOKIE,
};

/// Username/password login minting our own token pair. Backs the local,
/// LDAP and PAM providers, which differ only in their authenticator.
pub struct PasswordProvider {
    codec: Arc<TokenCodec>,
    authenticator: Arc<dyn PasswordAuthenticator>,
    ages: TokenAges,
    site: SiteConfig,
    embed_refresh: bool,
    check_os_user: bool,
}

impl PasswordProvider {
    pub fn new(
        codec: Arc<TokenCodec>,
        authenticator: Arc<dyn PasswordAuthenticator>,
        ages: TokenAges,
        site: SiteConfig,
        embed_refresh: bool,
        check_os_user: bool,
    ) -> Self {
        Self {
            codec,
            authenticator,
            ages,
            site,
            embed_refresh,
            check_os_user,
        }
    }

    pub fn codec(&self) -> &Arc<TokenCodec> {
        &self.codec
    }

    #[tracing::instrument(skip(self, password), err)]
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenGrant, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MalformedLogin);
        }
        if !self.authenticator.authenticate(username, password).await? {
            tracing::info!("Failed login for {username}");
            return Err(AuthError::InvalidCredentials);
        }
        if self.check_os_user && !os_user_exists(username) {
            tracing::warn!("User {username} authenticated but has no local account");
            return Err(AuthError::UnknownOsUser);
        }
        tracing::info!("Authenticated as user {username}");
        self.grant(username, true)
    }

    fn grant(&self, username: &str, with_refresh: bool) -> Result<TokenGrant, AuthError> {
        let access_token = self
            .codec
            .issue(username, TokenKind::Access, self.ages.access)?;
        let mut grant = TokenGrant {
            access_token,
            expires_in: self.ages.access.as_secs() as i64,
            username: None,
            refresh_token: None,
            cookies: Vec::new(),
        };
        if with_refresh {
            let refresh_token = self
                .codec
                .issue(username, TokenKind::Refresh, self.ages.refresh)?;
            grant.cookies.push(auth_cookie(
                REFRESH_COOKIE,
                refresh_token.clone(),
                self.ages.refresh.as_secs(),
                &self.site,
            ));
            if self.embed_refresh {
                grant.refresh_token = Some(refresh_token);
            }
        }
        Ok(grant)
    }

    /// Exchanges a refresh token for a new access (or scripting) token.
    pub fn refresh(&self, refresh_token: Option<&str>, scripting: bool) -> Result<TokenGrant, AuthError> {
        let refresh_token = refresh_token.ok_or(AuthError::MissingRefreshToken)?;
        let claims = self
            .codec
            .verify(refresh_token)
            .filter(|claims| claims.kind() == TokenKind::Refresh)
            .ok_or(AuthError::NotAuthorized)?;
        let mut grant = if scripting {
            self.scripting_grant(&claims.username)?
        } else {
            self.grant(&claims.username, false)?
        };
        grant.username = Some(claims.username);
        Ok(grant)
    }

    pub fn scripting_grant(&self, username: &str) -> Result<TokenGrant, AuthError> {
        let access_token = self
            .codec
            .issue(username, TokenKind::Scripting, self.ages.scripting)?;
        Ok(TokenGrant {
            access_token,
            expires_in: self.ages.scripting.as_secs() as i64,
            username: Some(username.to_string()),
            refresh_token: None,
            cookies: Vec::new(),
        })
    }

    pub fn logout(&self) -> AuthReply {
        AuthReply::json(serde_json::json!({ "success": true }))
            .with_cookie(clear_cookie(REFRESH_COOKIE, &self.site))
    }
}
