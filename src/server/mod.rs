//! HTTP and WebSocket surface of a node

mod lodge;
mod lumber;
mod proxy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::HeaderMap;
use axum::http::header::ACCEPT;
use axum::routing::get;

use lumberjack_lodge::Lodge;
use lumberjack_logs::LogBuffer;

use crate::Config;

/// Shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub lodge: Arc<Lodge>,

    /// One buffer per tailed file, keyed by path
    pub buffers: Arc<HashMap<String, LogBuffer>>,

    /// Port assumed for peers addressed without one
    pub listen_port: u16,

    pub subscriber_queue: usize,

    pub proxy_connect_timeout: Duration,
}

impl AppState {
    pub fn new(lodge: Arc<Lodge>, buffers: HashMap<String, LogBuffer>, config: &Config) -> Self {
        Self {
            lodge,
            buffers: Arc::new(buffers),
            listen_port: config.listen_port,
            subscriber_queue: config.subscriber_queue,
            proxy_connect_timeout: config.proxy_connect_timeout,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(lodge::index))
        .route("/lodge", get(lodge::directory).post(lodge::check_in))
        .route("/logs/:slug", get(lumber::view))
        .route("/logs/:slug/socket", get(lumber::socket))
        .route("/proxy/:host/:slug", get(proxy::view))
        .route("/proxy/:host/:slug/socket", get(proxy::socket))
        .with_state(state)
}

/// Whether the client asked for JSON rather than a human-readable page
fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_wants_json() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("text/html"));
        assert!(!wants_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("text/html, application/json"));
        assert!(wants_json(&headers));
    }
}
