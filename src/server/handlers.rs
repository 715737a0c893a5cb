//! HTTP request handlers for the image API.
//!
//! # Endpoints
//!
//! - `POST /api/images` - Upload an original (multipart, field `image`)
//! - `GET /api/images` - List the caller's images
//! - `GET /api/images/{id}` - Fetch one image record with its variants and failures
//! - `POST /api/images/{id}/transform` - Queue a transformation
//! - `GET /health` - Health check endpoint

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::auth::AuthUser;
use crate::error::{QueueError, ServiceError, SpecError, StoreError};
use crate::records::ImageRecord;
use crate::service::ImageService;
use crate::transform::TransformSpec;

/// Multipart field carrying the uploaded file.
pub const UPLOAD_FIELD: &str = "image";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImageService>,
}

impl AppState {
    pub fn new(service: Arc<ImageService>) -> Self {
        Self { service }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Query parameters for the image list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListQueryParams {
    /// 1-based page number (default: 1)
    #[serde(default)]
    pub page: Option<u32>,

    /// Page size (default: 10, max: 100)
    #[serde(default)]
    pub limit: Option<u32>,
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "invalid_transformations")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Create a new error response with status code.
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Response to an accepted transform request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResponse {
    pub message: String,
    pub image_id: String,
    pub job_id: String,
    pub transformations: TransformSpec,
}

/// One page of the caller's images.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageListResponse {
    pub images: Vec<ImageRecord>,
    pub total: u64,
    pub total_pages: u64,
    pub current_page: u32,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Wrapper for service errors to implement IntoResponse.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

/// Convert ServiceError to HTTP response.
///
/// 5xx errors are logged at ERROR, 404s at DEBUG and other 4xx at WARN.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, error_type) = match &self.0 {
            ServiceError::InvalidSpec(_) => (StatusCode::BAD_REQUEST, "invalid_transformations"),
            ServiceError::InvalidUpload(_) => (StatusCode::BAD_REQUEST, "invalid_upload"),
            ServiceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),

            ServiceError::Store(store_err) => match store_err {
                StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                StoreError::Connection(_) => (StatusCode::BAD_GATEWAY, "connection_error"),
                StoreError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                StoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                StoreError::Backend(_) | StoreError::InvalidLocation(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
                }
            },

            ServiceError::Queue(QueueError::Closed) => {
                (StatusCode::SERVICE_UNAVAILABLE, "queue_closed")
            }
            ServiceError::Queue(_) => (StatusCode::INTERNAL_SERVER_ERROR, "queue_error"),

            ServiceError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if status == StatusCode::NOT_FOUND {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Resource not found: {}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle image uploads.
///
/// # Endpoint
///
/// `POST /api/images` with a `multipart/form-data` body whose `image` field
/// holds the file.
///
/// # Response
///
/// - `201 Created`: the new image record
/// - `400 Bad Request`: missing file, disallowed type, too large, or not an image
pub async fn upload_handler(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ImageRecord>), ApiError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        ApiError(ServiceError::InvalidUpload(e.body_text()))
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(invalid)?;

        let record = state
            .service
            .submit_upload(&user.user_id, bytes, &filename, &mime_type)
            .await?;
        return Ok((StatusCode::CREATED, Json(record)));
    }

    Err(ApiError(ServiceError::InvalidUpload(
        "No image file provided".to_string(),
    )))
}

/// Handle transform requests.
///
/// # Endpoint
///
/// `POST /api/images/{id}/transform` with body `{"transformations": {...}}`
///
/// # Response
///
/// - `202 Accepted`: the job was queued; the variant appears on the record
///   once a worker finishes it
/// - `400 Bad Request`: missing or invalid transformations
/// - `404 Not Found`: no such image for this user
pub async fn transform_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(image_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<TransformResponse>), ApiError> {
    let Json(body) = body.map_err(|rejection| {
        ApiError(ServiceError::InvalidSpec(SpecError::malformed(format!(
            "Request body must be JSON: {}",
            rejection.body_text()
        ))))
    })?;
    let raw = body.get("transformations").unwrap_or(&Value::Null);

    let accepted = state
        .service
        .request_transform(&user.user_id, &image_id, raw)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TransformResponse {
            message: "Transformation queued".to_string(),
            image_id: accepted.image_id,
            job_id: accepted.job_id,
            transformations: accepted.transformations,
        }),
    ))
}

/// Handle single image lookups.
///
/// # Endpoint
///
/// `GET /api/images/{id}`
///
/// Served through the record cache, so a just-finished variant may take up
/// to the cache TTL to appear unless the worker shares this process.
pub async fn get_image_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(image_id): Path<String>,
) -> Result<Json<ImageRecord>, ApiError> {
    let record = state.service.get_image(&user.user_id, &image_id).await?;
    Ok(Json(record))
}

/// Handle image list requests.
///
/// # Endpoint
///
/// `GET /api/images?page=1&limit=10`
pub async fn list_images_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQueryParams>,
) -> Result<Json<ImageListResponse>, ApiError> {
    let page = state
        .service
        .list_images(&user.user_id, query.page, query.limit)
        .await?;

    Ok(Json(ImageListResponse {
        images: page.images,
        total: page.total,
        total_pages: page.total_pages,
        current_page: page.current_page,
    }))
}

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
