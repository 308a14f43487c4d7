use auth::{config::SiteConfig, AuthBroker};
use axum::extract::FromRef;
use runner::Supervisor;
use serde::Serialize;
use std::sync::Arc;

/// Addresses the dashboard needs at runtime, served from `/config`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub dashboard_address: String,
    pub api_address: String,
    pub token_refresh_address: String,
    pub logout_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_client_id: Option<String>,
}

impl ClientConfig {
    pub fn new(site: &SiteConfig, google_client_id: Option<String>) -> Self {
        let base = site.server_address.trim_end_matches('/');
        Self {
            dashboard_address: site.dashboard_url(),
            api_address: format!("{base}{}", site.api_path),
            token_refresh_address: format!("{base}{}", site.refresh_path()),
            logout_address: format!("{base}{}", site.logout_path()),
            google_client_id,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<AuthBroker>,
    pub supervisor: Supervisor,
    pub client_config: Arc<ClientConfig>,
}

impl FromRef<AppState> for Arc<AuthBroker> {
    fn from_ref(input: &AppState) -> Self {
        input.broker.clone()
    }
}
impl FromRef<AppState> for Supervisor {
    fn from_ref(input: &AppState) -> Self {
        input.supervisor.clone()
    }
}
impl FromRef<AppState> for Arc<ClientConfig> {
    fn from_ref(input: &AppState) -> Self {
        input.client_config.clone()
    }
}
