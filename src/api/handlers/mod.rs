//! API handlers and the translation of identity errors into HTTP responses.
//!
//! Handlers never build status codes from component errors themselves; they
//! convert through [`ApiError`], which is the only place that decides what a
//! client gets to see. Storage details are logged and replaced by a generic
//! message.

pub mod health;
pub mod users;

use axum::{
    http::{
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::identity::{authorize, GuardError, Identity, IdentityError, Principal, TokenError};
use crate::store::Store;

/// Error body shared by every endpoint.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorDetail {
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }

    /// Map an identity failure; storage failures get `storage_status`.
    #[must_use]
    pub fn from_identity(err: &IdentityError, storage_status: StatusCode) -> Self {
        match err {
            IdentityError::Validation(_)
            | IdentityError::Conflict
            | IdentityError::NoSuchUser
            | IdentityError::Token(TokenError::NotFound | TokenError::Expired) => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            IdentityError::NotAuthenticated => Self::new(StatusCode::UNAUTHORIZED, err.to_string()),
            IdentityError::Storage(inner) => {
                error!("Storage failure: {inner}");
                if storage_status == StatusCode::SERVICE_UNAVAILABLE {
                    Self::new(storage_status, "Service temporarily unavailable")
                } else {
                    Self::internal()
                }
            }
            IdentityError::Token(inner) => {
                error!("Token failure: {inner}");
                Self::internal()
            }
            IdentityError::Internal(message) => {
                error!("Internal failure: {message}");
                Self::internal()
            }
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        Self::from_identity(&err, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Unauthorized => Self::new(StatusCode::UNAUTHORIZED, err.to_string()),
            GuardError::Forbidden => Self::new(StatusCode::FORBIDDEN, err.to_string()),
            GuardError::Storage(inner) => {
                error!("Storage failure while authorizing: {inner}");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorDetail {
            detail: self.detail,
        });
        if self.status == StatusCode::UNAUTHORIZED {
            (self.status, [(WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (self.status, body).into_response()
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Resolve the request's bearer token into an active principal.
pub(crate) async fn require_principal(
    headers: &HeaderMap,
    store: &dyn Store,
    identity: &Identity,
) -> Result<Principal, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))?;
    Ok(authorize(store, identity.sessions(), token).await?)
}
