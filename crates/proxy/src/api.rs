use axum::{
    extract::State,
    http::{header, HeaderValue},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::{
    server_handlers,
    state::{AppState, ClientConfig},
};

/// The internal API behind the proxy: `{api}/auth`, `{api}/server` and
/// `/config`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .nest("/auth", auth::handlers::router())
        .nest("/server", server_handlers::router())
        .layer(middleware::map_response(no_cache));
    let api_path = state.broker.site().api_path.clone();
    Router::new()
        .nest(&api_path, api)
        .route("/config", get(client_config))
        .with_state(state)
}

async fn no_cache(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::EXPIRES, HeaderValue::from_static("-1"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

async fn client_config(State(config): State<Arc<ClientConfig>>) -> impl IntoResponse {
    Json(config.as_ref().clone())
}
