use auth::AuthBroker;
use pingora::{prelude::background_service, server::Server};
use proxy::{ApiBackgroundService, AppState, BrokerProxy, ClientConfig};
use runner::Supervisor;
use session_broker::{
    cli::CliArgs,
    config::{config_path, BrokerConfig, CONFIG_PATH_ENV},
    observability::init_tracing,
    self_test,
};
use std::{error::Error, process::ExitCode, sync::Arc};

/// Public proxy plus the internal API as a background service.
fn build_server(config: &BrokerConfig, broker: Arc<AuthBroker>) -> Result<Server, Box<dyn Error>> {
    let supervisor = Supervisor::new(config.processes.clone());
    let google_client_id = config
        .auth
        .google
        .as_ref()
        .map(|google| google.client_id.clone());
    let state = AppState {
        broker: broker.clone(),
        supervisor: supervisor.clone(),
        client_config: Arc::new(ClientConfig::new(&config.server.site, google_client_id)),
    };

    let mut server = Server::new(None)?;
    server.bootstrap();
    let mut proxy = pingora::proxy::http_proxy_service(
        &server.configuration,
        BrokerProxy::new(broker, supervisor, &config.server),
    );
    proxy.add_tcp(&config.server.listen_address);
    let api = background_service(
        "api",
        ApiBackgroundService {
            state,
            address: config.server.api_address,
        },
    );
    server.add_service(proxy);
    server.add_service(api);
    tracing::info!(
        "Listening on {}, internal API on {}",
        config.server.listen_address,
        config.server.api_address
    );
    Ok(server)
}

#[allow(unreachable_code)]
fn main() -> ExitCode {
    let args = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let path = config_path(args.config.as_deref(), std::env::var(CONFIG_PATH_ENV).ok());
    let config = match BrokerConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_level);

    // Outlives pingora's runtimes: user table watchers and store
    // connections built here keep running on it.
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("{err:?}");
            return ExitCode::FAILURE;
        }
    };
    let broker = match runtime.block_on(AuthBroker::from_config(&config.auth, &config.server.site)) {
        Ok(broker) => Arc::new(broker),
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(username) = args.test_user {
        return match runtime.block_on(self_test::run(&broker, &username)) {
            Ok(()) => {
                tracing::info!("Self test for {username} passed");
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!("Self test for {username} failed: {err}");
                ExitCode::FAILURE
            }
        };
    }

    let mut server = match build_server(&config, broker) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!("{err:?}");
            return ExitCode::FAILURE;
        }
    };
    server.run_forever();
    ExitCode::SUCCESS
}
