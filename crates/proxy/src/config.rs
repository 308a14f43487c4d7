use auth::config::SiteConfig;
use serde::Deserialize;
use std::net::SocketAddr;

/// `[server]` as written in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfigDeserialize {
    #[serde(flatten)]
    pub site: SiteConfig,
    #[serde(default = "ServerConfigDeserialize::default_listen_address")]
    pub listen_address: String,
    /// Loopback port of the internal auth/server API.
    #[serde(default = "ServerConfigDeserialize::default_api_port")]
    pub api_port: u16,
    /// Header carrying the worker's secret on proxied requests.
    #[serde(default = "ServerConfigDeserialize::default_secret_header")]
    pub secret_header: String,
    /// Where everything outside the API is sent, usually a static file server
    /// for the frontend and dashboard.
    pub frontend_address: Option<SocketAddr>,
}

impl ServerConfigDeserialize {
    fn default_listen_address() -> String {
        "0.0.0.0:8000".to_string()
    }
    fn default_api_port() -> u16 {
        8001
    }
    fn default_secret_header() -> String {
        "x-broker-auth-token".to_string()
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub site: SiteConfig,
    pub listen_address: String,
    pub api_address: SocketAddr,
    pub secret_header: String,
    pub frontend_address: Option<SocketAddr>,
}

impl ServerConfig {
    pub fn new(other: ServerConfigDeserialize) -> Result<ServerConfig, String> {
        if !other.site.api_path.starts_with('/') || other.site.api_path.len() < 2 {
            return Err(format!("api_path {:?} must be a non-root absolute path", other.site.api_path));
        }
        if other.secret_header.trim().is_empty() {
            return Err("secret_header is empty".to_string());
        }
        Ok(ServerConfig {
            site: other.site,
            listen_address: other.listen_address,
            api_address: SocketAddr::from(([127, 0, 0, 1], other.api_port)),
            secret_header: other.secret_header.to_ascii_lowercase(),
            frontend_address: other.frontend_address,
        })
    }
}
