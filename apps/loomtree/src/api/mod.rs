//! # Loom Tree HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health`, `GET /status`, `GET /revision`
//! - `GET|PATCH /preferences`
//! - `POST|GET /trees`, `GET|PATCH|DELETE /trees/{id}`
//! - `GET /trees/{id}/{root,nodes,bookmarks,paths,audit,export}`, `POST /trees/{id}/paths`
//! - `POST /import`
//! - `GET /nodes/{id}`, `PATCH /nodes/{id}/metadata`, `POST /nodes/{id}/annotations`
//! - `GET /nodes/{id}/{verify,verify-chain,versions,lineage,evidence}`
//! - `GET|DELETE /paths/{id}`, `GET /paths/{id}/{context,active}`
//! - `POST /paths/{id}/{advance,navigate,truncate,selections,messages,generate,completions,edit}`
//! - `DELETE /paths/{id}/selections/{target}`
//!
//! ## Security Configuration
//!
//! See [`crate::config::ServerConfig`]: CORS origins, rate limit, API key.

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{ApiKey, key_matches};
pub use handlers::{ApiError, status_for};
pub use middleware::{GlobalRateLimiter, create_rate_limiter};
pub use types::*;

use crate::config::{Config, ServerConfig};
use crate::provider::ModelProvider;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use loomtree_core::{LoomError, Session};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The engine session. Writers hold the lock for one transaction only.
    pub session: Arc<RwLock<Session>>,
    pub provider: Arc<dyn ModelProvider>,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(session: Session, provider: Arc<dyn ModelProvider>, config: Config) -> Self {
        Self {
            session: Arc::new(RwLock::new(session)),
            provider,
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer.
///
/// - `"*"`: allows all origins (development only)
/// - unset: localhost only
/// - otherwise: comma-separated list of allowed origins
fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some("*") => {
            tracing::warn!("CORS: Allowing ALL origins. This is insecure for production!");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!("CORS: No valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                restricted_cors(allowed_origins)
            }
        }
        None => {
            tracing::info!("CORS: No origins configured, defaulting to localhost only");
            build_localhost_cors()
        }
    }
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Build a restrictive CORS layer that only allows localhost origins.
fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    restricted_cors(origins)
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. CORS - handles preflight requests
/// 3. Body limit
/// 4. Rate Limiting (if enabled)
/// 5. Authentication (if configured)
pub fn create_router(state: AppState) -> Router {
    let server: ServerConfig = state.config.server.clone();
    let cors = build_cors_layer(server.cors_origins.as_deref());

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/revision", get(handlers::revision_handler))
        .route(
            "/preferences",
            get(handlers::get_preferences_handler).patch(handlers::update_preferences_handler),
        )
        .route(
            "/trees",
            get(handlers::list_trees_handler).post(handlers::create_tree_handler),
        )
        .route(
            "/trees/{tree_id}",
            get(handlers::get_tree_handler)
                .patch(handlers::update_tree_handler)
                .delete(handlers::delete_tree_handler),
        )
        .route("/trees/{tree_id}/root", get(handlers::tree_root_handler))
        .route("/trees/{tree_id}/nodes", get(handlers::tree_nodes_handler))
        .route("/trees/{tree_id}/bookmarks", get(handlers::bookmarks_handler))
        .route(
            "/trees/{tree_id}/paths",
            get(handlers::tree_paths_handler).post(handlers::create_path_handler),
        )
        .route("/trees/{tree_id}/audit", get(handlers::audit_handler))
        .route("/trees/{tree_id}/export", get(handlers::export_handler))
        .route("/import", post(handlers::import_handler))
        .route("/nodes/{node_id}", get(handlers::get_node_handler))
        .route(
            "/nodes/{node_id}/metadata",
            axum::routing::patch(handlers::update_metadata_handler),
        )
        .route("/nodes/{node_id}/annotations", post(handlers::annotate_handler))
        .route("/nodes/{node_id}/verify", get(handlers::verify_handler))
        .route("/nodes/{node_id}/verify-chain", get(handlers::verify_chain_handler))
        .route("/nodes/{node_id}/versions", get(handlers::versions_handler))
        .route("/nodes/{node_id}/lineage", get(handlers::lineage_handler))
        .route("/nodes/{node_id}/evidence", get(handlers::evidence_handler))
        .route(
            "/paths/{path_id}",
            get(handlers::get_path_handler).delete(handlers::delete_path_handler),
        )
        .route("/paths/{path_id}/context", get(handlers::context_handler))
        .route("/paths/{path_id}/active", get(handlers::active_node_handler))
        .route("/paths/{path_id}/advance", post(handlers::advance_handler))
        .route("/paths/{path_id}/navigate", post(handlers::navigate_handler))
        .route("/paths/{path_id}/truncate", post(handlers::truncate_handler))
        .route("/paths/{path_id}/selections", post(handlers::select_handler))
        .route(
            "/paths/{path_id}/selections/{target_id}",
            delete(handlers::clear_selection_handler),
        )
        .route("/paths/{path_id}/messages", post(handlers::message_handler))
        .route("/paths/{path_id}/generate", post(handlers::generate_handler))
        .route("/paths/{path_id}/completions", post(handlers::completion_handler))
        .route("/paths/{path_id}/edit", post(handlers::edit_handler));

    // Innermost: runs last on the request.
    match server.api_key.filter(|k| !k.is_empty()) {
        Some(key) => {
            tracing::info!("API key authentication enabled");
            router = router.layer(axum_middleware::from_fn_with_state(
                ApiKey::from(key),
                auth::api_key_auth_middleware,
            ));
        }
        None => {
            tracing::warn!(
                "API key authentication DISABLED - all endpoints are publicly accessible! \
                 Set LOOMTREE_API_KEY to enable authentication."
            );
        }
    }

    if server.rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", server.rate_limit);
        router = router.layer(axum_middleware::from_fn_with_state(
            create_rate_limiter(server.rate_limit),
            middleware::rate_limit_middleware,
        ));
    } else {
        tracing::info!("Rate limiting disabled");
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(axum::extract::DefaultBodyLimit::max(server.body_limit)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Bind and serve until Ctrl+C.
pub async fn run_server(state: AppState) -> Result<(), LoomError> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| LoomError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("Loom Tree HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| LoomError::IoError(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
