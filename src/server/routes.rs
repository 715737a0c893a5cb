//! Router configuration for the image API.
//!
//! # Route Structure
//!
//! ```text
//! /health                     - Health check (public)
//! /api/images                 - Upload (POST) and list (GET) (protected)
//! /api/images/{id}            - Image record (protected)
//! /api/images/{id}/transform  - Queue a transformation (protected)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use imgflow::server::routes::{create_router, RouterConfig};
//!
//! let config = RouterConfig::new("my-secret-key")
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//! let router = create_router(service, config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::{auth_middleware, dev_user_middleware, AuthVerifier, TokenAuth};
use super::handlers::{
    get_image_handler, health_handler, list_images_handler, transform_handler, upload_handler,
    AppState,
};
use crate::service::ImageService;

/// Prefix for every image route.
pub const API_PREFIX: &str = "/api";

/// Room for multipart framing on top of the largest accepted file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Clone)]
pub struct RouterConfig {
    /// Secret key for bearer token verification
    pub auth_secret: String,

    /// Whether authentication is enabled
    pub auth_enabled: bool,

    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl RouterConfig {
    /// Create a new router configuration with the given auth secret.
    ///
    /// Authentication and tracing are enabled and CORS allows any origin.
    pub fn new(auth_secret: impl Into<String>) -> Self {
        Self {
            auth_secret: auth_secret.into(),
            auth_enabled: true,
            cors_origins: None,
            enable_tracing: true,
        }
    }

    /// Create a configuration with authentication disabled.
    ///
    /// Every request acts as the same development user. Only for local
    /// development and testing.
    pub fn without_auth() -> Self {
        Self {
            auth_secret: String::new(),
            auth_enabled: false,
            cors_origins: None,
            enable_tracing: true,
        }
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Allow any CORS origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    /// Enable or disable authentication.
    pub fn with_auth_enabled(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router verifying tokens signed with the
/// configured secret.
pub fn create_router(service: Arc<ImageService>, config: RouterConfig) -> Router {
    let verifier: Arc<dyn AuthVerifier> = Arc::new(TokenAuth::new(&config.auth_secret));
    create_router_with_verifier(service, verifier, config)
}

/// Create the application router with a custom [`AuthVerifier`].
pub fn create_router_with_verifier(
    service: Arc<ImageService>,
    verifier: Arc<dyn AuthVerifier>,
    config: RouterConfig,
) -> Router {
    let body_limit = service.config().max_upload_bytes + MULTIPART_OVERHEAD;
    let app_state = AppState::new(service);
    let cors = build_cors_layer(&config);

    let image_routes = Router::new()
        .route("/", post(upload_handler).get(list_images_handler))
        .route("/{id}", get(get_image_handler))
        .route("/{id}/transform", post(transform_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state);

    // Auth is applied after nesting so it covers every image route
    let api_routes = Router::new().nest("/images", image_routes);
    let protected_routes = if config.auth_enabled {
        Router::new()
            .nest(API_PREFIX, api_routes)
            .layer(middleware::from_fn_with_state(verifier, auth_middleware))
    } else {
        Router::new()
            .nest(API_PREFIX, api_routes)
            .layer(middleware::from_fn(dev_user_middleware))
    };

    let public_routes = Router::new().route("/health", get(health_handler));

    let router = Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
