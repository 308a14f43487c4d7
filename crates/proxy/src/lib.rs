pub mod api;
pub mod bg_services;
pub mod config;
pub mod proxy;
pub mod routing;
pub mod server_handlers;
pub mod state;

pub use bg_services::ApiBackgroundService;
pub use config::{ServerConfig, ServerConfigDeserialize};
pub use proxy::BrokerProxy;
pub use state::{AppState, ClientConfig};
