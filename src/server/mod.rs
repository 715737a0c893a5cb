//! HTTP server layer.
//!
//! Exposes [`ImageService`](crate::service::ImageService) over axum.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │    POST /api/images   POST /api/images/{id}/transform           │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │    auth     │  │        routes           │  │
//! │  │ (requests)  │  │  (bearer)   │  │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::{
    auth_middleware, dev_user_middleware, AuthError, AuthUser, AuthVerifier, TokenAuth,
    DEV_USER_ID,
};
pub use handlers::{
    get_image_handler, health_handler, list_images_handler, transform_handler, upload_handler,
    ApiError, AppState, ErrorResponse, HealthResponse, ImageListResponse, ListQueryParams,
    TransformResponse, UPLOAD_FIELD,
};
pub use routes::{create_router, create_router_with_verifier, RouterConfig, API_PREFIX};
