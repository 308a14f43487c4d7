use auth::AuthBroker;
use bytes::Bytes;
use http::StatusCode;
use pingora::{
    http::{RequestHeader, ResponseHeader},
    prelude::{HttpPeer, Session},
};
use runner::{Supervisor, WorkerInfo};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};

use crate::{
    config::ServerConfig,
    routing::{classify, is_upgrade, resolve_worker, Route},
};

#[derive(Default, Debug)]
pub struct ReqContext {
    route: Option<Route>,
    worker: Option<WorkerInfo>,
}

/// Public front door. Worker-bound traffic goes to the user's worker on
/// loopback, the API to the internal axum service, and the rest to the
/// optional frontend address.
pub struct BrokerProxy {
    broker: Arc<AuthBroker>,
    supervisor: Supervisor,
    api_path: String,
    api_address: SocketAddr,
    frontend_address: Option<SocketAddr>,
    secret_header: String,
}

impl BrokerProxy {
    pub fn new(broker: Arc<AuthBroker>, supervisor: Supervisor, config: &ServerConfig) -> Self {
        Self {
            broker,
            supervisor,
            api_path: config.site.api_path.clone(),
            api_address: config.api_address,
            frontend_address: config.frontend_address,
            secret_header: config.secret_header.clone(),
        }
    }

    fn peer_address(&self, ctx: &ReqContext) -> SocketAddr {
        match (&ctx.worker, ctx.route) {
            (Some(worker), _) => SocketAddr::from(([127, 0, 0, 1], worker.port)),
            (None, Some(Route::Frontend)) => self.frontend_address.unwrap_or(self.api_address),
            _ => self.api_address,
        }
    }
}

async fn respond_json(session: &mut Session, status: StatusCode, body: Value) -> pingora::Result<()> {
    let body = Bytes::from(body.to_string());
    let mut header = ResponseHeader::build(status.as_u16(), Some(2))?;
    header.insert_header(http::header::CONTENT_TYPE, "application/json")?;
    header.insert_header(http::header::CONTENT_LENGTH, body.len().to_string())?;
    session.write_response_header(Box::new(header), false).await?;
    session.write_response_body(Some(body), true).await
}

#[async_trait::async_trait]
impl pingora::prelude::ProxyHttp for BrokerProxy {
    type CTX = ReqContext;
    fn new_ctx(&self) -> Self::CTX {
        ReqContext::default()
    }

    #[tracing::instrument(skip_all, err)]
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<bool> {
        let parts: &http::request::Parts = session.req_header().as_ref();
        let route = classify(parts.uri.path(), is_upgrade(&parts.headers), &self.api_path);
        ctx.route = Some(route);
        if !route.needs_worker() {
            return Ok(false);
        }
        match resolve_worker(&self.broker, &self.supervisor, route, parts).await {
            Ok(worker) => {
                ctx.worker = Some(worker);
                Ok(false)
            }
            Err(err) => {
                if err.status_code().is_server_error() {
                    tracing::error!("{err:?}");
                }
                respond_json(session, err.status_code(), err.body()).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        Ok(Box::new(HttpPeer::new(
            self.peer_address(ctx),
            false,
            String::new(),
        )))
    }

    #[tracing::instrument(skip_all, err)]
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        // Only we may speak for a worker.
        if upstream_request
            .remove_header(self.secret_header.as_str())
            .is_some()
        {
            tracing::warn!("Dropped client supplied {} header", self.secret_header);
        }
        if let Some(worker) = &ctx.worker {
            upstream_request.insert_header(self.secret_header.clone(), worker.secret.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ServerConfigDeserialize, state::tests::test_state};

    fn proxy(frontend: Option<&str>) -> BrokerProxy {
        let mut config: ServerConfigDeserialize = toml::from_str("api_port = 9100").unwrap();
        config.frontend_address = frontend.map(|address| address.parse().unwrap());
        let config = ServerConfig::new(config).unwrap();
        let state = test_state("exec sleep 5");
        BrokerProxy::new(state.broker, state.supervisor, &config)
    }

    fn worker(port: u16) -> WorkerInfo {
        WorkerInfo {
            username: "alice".to_string(),
            pid: 1,
            port,
            secret: "s3cret".to_string(),
        }
    }

    #[test]
    fn picks_upstream() {
        let with_frontend = proxy(Some("127.0.0.1:9200"));
        let ctx = |route, worker| ReqContext {
            route: Some(route),
            worker,
        };
        assert_eq!(
            with_frontend.peer_address(&ctx(Route::WebSocket, Some(worker(3005)))),
            "127.0.0.1:3005".parse().unwrap()
        );
        assert_eq!(
            with_frontend.peer_address(&ctx(Route::Api, None)),
            "127.0.0.1:9100".parse().unwrap()
        );
        assert_eq!(
            with_frontend.peer_address(&ctx(Route::Frontend, None)),
            "127.0.0.1:9200".parse().unwrap()
        );

        let without_frontend = proxy(None);
        assert_eq!(
            without_frontend.peer_address(&ctx(Route::Frontend, None)),
            "127.0.0.1:9100".parse().unwrap()
        );
    }
}
