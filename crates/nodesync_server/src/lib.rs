//! nodesync server
//!
//! Hosts the authoritative side of nodesync workspaces: replicas push
//! mutations and stream change batches over a WebSocket, with plain HTTP
//! endpoints for the same operations.
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATABASE_PATH`: Directory for per-workspace databases (default: ./data)
//! - `ENGINE_CONFIG`: Optional engine TOML file
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins
//! - `RUST_LOG`: Log filter (default: nodesync_server=debug,nodesync_core=info,tower_http=debug)

pub mod config;
pub mod handlers;
pub mod state;

pub use config::Config;
pub use state::SyncState;

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    routing::get,
};
use handlers::{api::ApiState, api_routes, ws::WsState, ws_handler};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the router serving `sync_state`.
pub fn app(sync_state: Arc<SyncState>, config: &Config) -> Router {
    let api_state = ApiState {
        sync_state: sync_state.clone(),
        batch_size: config.engine.consumer_batch_size,
    };
    let ws_state = WsState { sync_state };

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let allow_origin = if config.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(handlers::api::ACTOR_HEADER),
        ])
        .allow_origin(allow_origin);

    Router::new()
        // Health check
        .route("/", get(|| async { "nodesync server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket sync endpoint
        .route("/sync", get(ws_handler).with_state(ws_state))
        // API routes
        .nest("/api", api_routes(api_state))
        // Add layers
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
