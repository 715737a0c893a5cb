//! Bearer-token authentication.
//!
//! Tokens are self-contained HMAC-SHA256 credentials binding a user id to an
//! expiry time:
//!
//! ```text
//! token     = "{user_id}.{exp}.{signature}"
//! signature = hex(HMAC-SHA256(secret_key, "{user_id}.{exp}"))
//! ```
//!
//! The user id may itself contain dots; the last two dot-separated fields
//! are always the expiry and the signature. Requests carry the token as
//! `Authorization: Bearer {token}` and the middleware attaches the verified
//! [`AuthUser`] to the request.
//!
//! # Example
//!
//! ```rust
//! use imgflow::server::auth::{AuthVerifier, TokenAuth};
//! use std::time::Duration;
//!
//! let auth = TokenAuth::new("my-secret-key");
//! let token = auth.sign("alice", Duration::from_secs(3600));
//!
//! assert_eq!(auth.verify(&token).unwrap(), "alice");
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::handlers::ErrorResponse;

// =============================================================================
// Types
// =============================================================================

/// HMAC-SHA256 type alias
type HmacSha256 = Hmac<Sha256>;

/// User id attached to every request when authentication is disabled.
pub const DEV_USER_ID: &str = "dev";

/// Authentication error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization: Bearer` header on the request
    MissingToken,

    /// Token does not have the `{user_id}.{exp}.{signature}` shape
    MalformedToken,

    /// Token has expired
    Expired {
        /// When the token expired
        expired_at: u64,
        /// Current time
        current_time: u64,
    },

    /// Signature does not match
    InvalidSignature,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "Missing bearer token"),
            AuthError::MalformedToken => write!(f, "Malformed token"),
            AuthError::Expired {
                expired_at,
                current_time,
            } => write!(
                f,
                "Token expired at {} (current time: {})",
                expired_at, current_time
            ),
            AuthError::InvalidSignature => write!(f, "Invalid token signature"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let error_type = match &self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedToken => "malformed_token",
            AuthError::Expired { .. } => "token_expired",
            AuthError::InvalidSignature => "invalid_signature",
        };
        let status = StatusCode::UNAUTHORIZED;
        let message = self.to_string();

        // A bad signature may be an attack; the rest are routine
        if self == AuthError::InvalidSignature {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Authentication failed: {}",
                message
            );
        } else {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Authentication failed: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// AuthVerifier
// =============================================================================

/// Turns a bearer token into the id of the user it was issued to.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// HMAC-SHA256 bearer tokens.
#[derive(Clone)]
pub struct TokenAuth {
    /// Secret key for HMAC computation
    secret_key: Vec<u8>,
}

impl TokenAuth {
    /// Create a new authenticator with the given secret key.
    ///
    /// The key should be at least 32 bytes.
    pub fn new(secret_key: impl AsRef<[u8]>) -> Self {
        Self {
            secret_key: secret_key.as_ref().to_vec(),
        }
    }

    /// Issue a token for `user_id` valid for `ttl`.
    pub fn sign(&self, user_id: &str, ttl: Duration) -> String {
        self.sign_with_expiry(user_id, now_secs().saturating_add(ttl.as_secs()))
    }

    /// Issue a token for `user_id` expiring at `expiry` (Unix epoch seconds).
    pub fn sign_with_expiry(&self, user_id: &str, expiry: u64) -> String {
        let signature = hex::encode(self.compute_signature(user_id, expiry));
        format!("{}.{}.{}", user_id, expiry, signature)
    }

    fn compute_signature(&self, user_id: &str, expiry: u64) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret_key).expect("HMAC can take key of any size");
        mac.update(user_id.as_bytes());
        mac.update(b".");
        mac.update(expiry.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl AuthVerifier for TokenAuth {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let mut fields = token.rsplitn(3, '.');
        let (Some(signature), Some(expiry), Some(user_id)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(AuthError::MalformedToken);
        };
        if user_id.is_empty() {
            return Err(AuthError::MalformedToken);
        }
        let expiry: u64 = expiry.parse().map_err(|_| AuthError::MalformedToken)?;
        let provided = hex::decode(signature).map_err(|_| AuthError::MalformedToken)?;

        // Check expiry first
        let current_time = now_secs();
        if current_time > expiry {
            return Err(AuthError::Expired {
                expired_at: expiry,
                current_time,
            });
        }

        let expected = self.compute_signature(user_id, expiry);
        if provided.ct_eq(&expected).into() {
            Ok(user_id.to_string())
        } else {
            Err(AuthError::InvalidSignature)
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Extract the token from an `Authorization: Bearer` header value.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

// =============================================================================
// Axum Middleware
// =============================================================================

/// The verified caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Axum middleware verifying the bearer token.
///
/// On success the request continues with an [`AuthUser`] extension; on
/// failure it is rejected with 401.
///
/// ```ignore
/// let verifier: Arc<dyn AuthVerifier> = Arc::new(TokenAuth::new("secret"));
/// let app = Router::new()
///     .route("/images", get(list_images_handler))
///     .layer(middleware::from_fn_with_state(verifier, auth_middleware));
/// ```
pub async fn auth_middleware(
    State(verifier): State<Arc<dyn AuthVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?;
    let token = header
        .to_str()
        .ok()
        .and_then(bearer_token)
        .ok_or(AuthError::MalformedToken)?;

    let user_id = verifier.verify(token)?;
    request.extensions_mut().insert(AuthUser { user_id });

    Ok(next.run(request).await)
}

/// Middleware used when authentication is disabled: every request acts as
/// [`DEV_USER_ID`].
pub async fn dev_user_middleware(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(AuthUser {
        user_id: DEV_USER_ID.to_string(),
    });
    next.run(request).await
}

// =============================================================================
// Tests
// =============================================================================
