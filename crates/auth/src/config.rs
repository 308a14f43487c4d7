use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use crate::AuthError;

fn default_algorithm() -> Algorithm {
    Algorithm::RS256
}
fn default_access_token_age() -> u64 {
    15 * 60
}
fn default_refresh_token_age() -> u64 {
    7 * 24 * 60 * 60
}
fn default_scripting_token_age() -> u64 {
    7 * 24 * 60 * 60
}
fn default_true() -> bool {
    true
}

/// Public facing addresses and cookie policy shared by every provider.
#[derive(Clone, Debug, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "SiteConfig::default_server_address")]
    pub server_address: String,
    #[serde(default = "SiteConfig::default_api_path")]
    pub api_path: String,
    #[serde(default = "SiteConfig::default_dashboard_path")]
    pub dashboard_path: String,
    /// Cleared only when the broker is served over plain http.
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
    #[serde(default)]
    pub scripting_enabled: bool,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            server_address: Self::default_server_address(),
            api_path: Self::default_api_path(),
            dashboard_path: Self::default_dashboard_path(),
            secure_cookies: true,
            scripting_enabled: false,
        }
    }
}

impl SiteConfig {
    fn default_server_address() -> String {
        "http://localhost:8000".to_string()
    }
    fn default_api_path() -> String {
        "/api".to_string()
    }
    fn default_dashboard_path() -> String {
        "/dashboard".to_string()
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}{}", self.server_address.trim_end_matches('/'), path)
    }
    /// Path the refresh cookie is scoped to. Covers refresh and logout.
    pub fn auth_path(&self) -> String {
        format!("{}/auth", self.api_path)
    }
    pub fn refresh_path(&self) -> String {
        format!("{}/auth/refresh", self.api_path)
    }
    pub fn logout_path(&self) -> String {
        format!("{}/auth/logout", self.api_path)
    }
    pub fn login_url(&self) -> String {
        self.absolute(&format!("{}/auth/login", self.api_path))
    }
    pub fn oidc_callback_url(&self) -> String {
        self.absolute(&format!("{}/auth/oidcCallback", self.api_path))
    }
    pub fn dashboard_url(&self) -> String {
        self.absolute(&self.dashboard_path)
    }
}

/// Keys and token lifetimes for a provider that mints its own tokens.
#[derive(Clone, Debug, Deserialize)]
pub struct SigningConfig {
    pub issuer: String,
    #[serde(default = "default_algorithm")]
    pub key_algorithm: Algorithm,
    pub private_key_location: PathBuf,
    pub public_key_location: PathBuf,
    /// Seconds.
    #[serde(default = "default_access_token_age")]
    pub access_token_age: u64,
    #[serde(default = "default_refresh_token_age")]
    pub refresh_token_age: u64,
    #[serde(default = "default_scripting_token_age")]
    pub scripting_token_age: u64,
}

impl SigningConfig {
    pub fn ages(&self) -> TokenAges {
        TokenAges {
            access: Duration::from_secs(self.access_token_age),
            refresh: Duration::from_secs(self.refresh_token_age),
            scripting: Duration::from_secs(self.scripting_token_age),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenAges {
    pub access: Duration,
    pub refresh: Duration,
    pub scripting: Duration,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LocalAuthConfig {
    #[serde(flatten)]
    pub signing: SigningConfig,
    pub database_path: PathBuf,
    #[serde(default)]
    pub embed_refresh: bool,
    pub user_lookup_table: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LdapAuthConfig {
    #[serde(flatten)]
    pub signing: SigningConfig,
    pub url: String,
    pub search_base: String,
    /// `{username}` is replaced by the escaped login name.
    #[serde(default = "LdapAuthConfig::default_search_filter")]
    pub search_filter: String,
    pub admin_dn: Option<String>,
    pub admin_password: Option<String>,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub embed_refresh: bool,
    pub user_lookup_table: Option<PathBuf>,
}

impl LdapAuthConfig {
    fn default_search_filter() -> String {
        "(uid={username})".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PamAuthConfig {
    #[serde(flatten)]
    pub signing: SigningConfig,
    #[serde(default = "PamAuthConfig::default_service")]
    pub service: String,
    #[serde(default)]
    pub embed_refresh: bool,
    pub user_lookup_table: Option<PathBuf>,
}

impl PamAuthConfig {
    fn default_service() -> String {
        "login".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GoogleAuthConfig {
    pub client_id: String,
    /// Hosted domain (`hd` claim) every user must belong to.
    pub valid_domain: Option<String>,
    #[serde(default)]
    pub use_email_as_id: bool,
    pub user_lookup_table: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExternalAuthConfig {
    pub issuers: Vec<String>,
    pub public_key_location: PathBuf,
    #[serde(default = "default_algorithm")]
    pub key_algorithm: Algorithm,
    #[serde(default = "ExternalAuthConfig::default_unique_field")]
    pub unique_field: String,
    pub user_lookup_table: Option<PathBuf>,
}

impl ExternalAuthConfig {
    fn default_unique_field() -> String {
        "username".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OidcAuthConfig {
    #[serde(flatten)]
    pub signing: SigningConfig,
    pub idp_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "OidcAuthConfig::default_scope")]
    pub scope: String,
    #[serde(default = "OidcAuthConfig::default_unique_field")]
    pub unique_field: String,
    pub required_group: Option<String>,
    #[serde(default = "OidcAuthConfig::default_groups_field")]
    pub groups_field: String,
    #[serde(default)]
    pub recheck_group_on_refresh: bool,
    /// Seconds of remaining validity below which a refresh goes upstream.
    #[serde(default = "OidcAuthConfig::default_min_validity")]
    pub cache_access_token_min_validity: u64,
    #[serde(default)]
    pub extra_auth_params: BTreeMap<String, String>,
    pub user_lookup_table: Option<PathBuf>,
    #[serde(default = "OidcAuthConfig::default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "OidcAuthConfig::default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,
    #[serde(default = "OidcAuthConfig::default_lock_ttl")]
    pub lock_ttl: u64,
    /// Bound on every call to the IdP; at most half of `lock_ttl` so a
    /// refresh finishes while its lease is still held.
    #[serde(default = "OidcAuthConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl OidcAuthConfig {
    fn default_scope() -> String {
        "openid".to_string()
    }
    fn default_unique_field() -> String {
        "preferred_username".to_string()
    }
    fn default_groups_field() -> String {
        "groups".to_string()
    }
    fn default_min_validity() -> u64 {
        60
    }
    fn default_lock_retries() -> u32 {
        40
    }
    fn default_lock_retry_interval_ms() -> u64 {
        500
    }
    fn default_lock_ttl() -> u64 {
        30
    }
    fn default_request_timeout_ms() -> u64 {
        10_000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn timeout_check(&self) -> Result<(), AuthError> {
        if self.request_timeout_ms == 0 || self.request_timeout_ms * 2 > self.lock_ttl * 1000 {
            return Err(AuthError::Config(format!(
                "oidc request_timeout_ms ({}) must be non-zero and at most half of lock_ttl ({}s)",
                self.request_timeout_ms, self.lock_ttl
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionStoreConfig {
    /// In-memory store when absent.
    pub redis_url: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    /// Reject password logins for names without a local OS account.
    #[serde(default = "default_true")]
    pub check_os_user: bool,
    pub local: Option<LocalAuthConfig>,
    pub ldap: Option<LdapAuthConfig>,
    pub pam: Option<PamAuthConfig>,
    pub google: Option<GoogleAuthConfig>,
    pub external: Option<ExternalAuthConfig>,
    pub oidc: Option<OidcAuthConfig>,
    #[serde(default)]
    pub session_store: SessionStoreConfig,
}

impl AuthConfig {
    /// Errors when more than one primary provider is configured.
    pub fn primary_count_check(&self) -> Result<(), AuthError> {
        let primaries = [
            self.local.is_some(),
            self.ldap.is_some(),
            self.pam.is_some(),
            self.oidc.is_some(),
        ];
        if primaries.iter().filter(|configured| **configured).count() > 1 {
            return Err(AuthError::Config(
                "only one of local, ldap, pam or oidc may be configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Primary provider count plus the OIDC lease and timeout bounds.
    pub fn validate(&self) -> Result<(), AuthError> {
        self.primary_count_check()?;
        if let Some(oidc) = &self.oidc {
            oidc.timeout_check()?;
        }
        Ok(())
    }

    /// Timeout for outgoing IdP and JWKS requests.
    pub fn request_timeout(&self) -> Duration {
        self.oidc.as_ref().map_or(
            Duration::from_millis(OidcAuthConfig::default_request_timeout_ms()),
            OidcAuthConfig::request_timeout,
        )
    }
}
