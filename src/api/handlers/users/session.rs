//! Login and logout.

use axum::{
    extract::{rejection::FormRejection, Extension},
    http::{HeaderMap, StatusCode},
    Form, Json,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::types::{LoginForm, LogoutResponse, TokenResponse};
use crate::api::handlers::{require_principal, ApiError, ErrorDetail};
use crate::identity::{Identity, IdentityError, RevokeOutcome};
use crate::store::Store;

/// Exchange username and password for a bearer session token.
#[utoipa::path(
    post,
    path = "/users/token",
    request_body(content = LoginForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Session token issued", body = TokenResponse),
        (status = 401, description = "Incorrect username or password", body = ErrorDetail)
    ),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn token(
    store: Extension<Arc<dyn Store>>,
    identity: Extension<Arc<Identity>>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Form(form) = form.map_err(|rejection| {
        debug!("login form rejected: {rejection}");
        ApiError::from(IdentityError::NotAuthenticated)
    })?;

    let grant = identity
        .login(store.0.as_ref(), &form.username, &form.password)
        .await?;

    info!(username = %grant.claims.sub, "session issued");

    Ok(Json(TokenResponse {
        access_token: grant.access_token,
        token_type: "bearer".to_string(),
    }))
}

/// Revoke the presented bearer token.
#[utoipa::path(
    get,
    path = "/users/logout",
    responses(
        (status = 200, description = "Token revoked", body = LogoutResponse),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorDetail),
        (status = 403, description = "Inactive user", body = ErrorDetail)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn logout(
    headers: HeaderMap,
    store: Extension<Arc<dyn Store>>,
    identity: Extension<Arc<Identity>>,
) -> Result<Json<LogoutResponse>, ApiError> {
    let principal = require_principal(&headers, store.0.as_ref(), &identity).await?;

    match identity.logout(store.0.as_ref(), &principal).await? {
        RevokeOutcome::Revoked => info!(username = %principal.user.username, "session revoked"),
        RevokeOutcome::AlreadyRevoked => debug!("session was revoked concurrently"),
    }

    Ok(Json(LogoutResponse {
        status_code: StatusCode::OK.as_u16(),
        detail: "You successfully logged out.".to_string(),
    }))
}
