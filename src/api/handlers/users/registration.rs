//! Signup, email confirmation and confirmation resend.

use axum::{
    extract::{Extension, Path},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::types::{RegistrationRequest, ResendConfirmationRequest};
use crate::api::handlers::{ApiError, ErrorDetail};
use crate::identity::{Identity, PublicUser};
use crate::store::Store;

const NOTIFICATION_HEADER: HeaderName = HeaderName::from_static("x-notification");

/// Create an inactive account and mail the signup link.
#[utoipa::path(
    post,
    path = "/users/registration",
    request_body = RegistrationRequest,
    responses(
        (status = 200, description = "User created; confirmation mail handed off", body = PublicUser,
            headers(("x-notification" = String, description = "sent, queued or failed"))),
        (status = 400, description = "Invalid input or email already registered", body = ErrorDetail),
        (status = 503, description = "Storage unavailable", body = ErrorDetail)
    ),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn registration(
    store: Extension<Arc<dyn Store>>,
    identity: Extension<Arc<Identity>>,
    payload: Option<Json<RegistrationRequest>>,
) -> Result<Response, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Missing payload"));
    };

    let registered = identity
        .register(store.0.as_ref(), request.into())
        .await
        .map_err(|err| ApiError::from_identity(&err, StatusCode::SERVICE_UNAVAILABLE))?;

    Ok((
        StatusCode::OK,
        [(
            NOTIFICATION_HEADER,
            HeaderValue::from_static(registered.delivery.as_str()),
        )],
        Json(registered.user),
    )
        .into_response())
}

/// Redeem a signup link and activate the account.
#[utoipa::path(
    post,
    path = "/users/confirm_email_reg/{token}/{email}",
    params(
        ("token" = String, Path, description = "Token from the confirmation link"),
        ("email" = String, Path, description = "Address the link was sent to")
    ),
    responses(
        (status = 200, description = "Account activated", body = PublicUser),
        (status = 400, description = "Unknown, consumed or expired token", body = ErrorDetail)
    ),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn confirm_email_reg(
    store: Extension<Arc<dyn Store>>,
    identity: Extension<Arc<Identity>>,
    Path((token, email)): Path<(String, String)>,
) -> Result<Json<PublicUser>, ApiError> {
    Ok(Json(identity.confirm(store.0.as_ref(), &token, &email).await?))
}

/// Mail a fresh signup link (always returns 204 to avoid user enumeration).
#[utoipa::path(
    post,
    path = "/users/resend_confirmation",
    request_body = ResendConfirmationRequest,
    responses(
        (status = 204, description = "Resend accepted")
    ),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn resend_confirmation(
    store: Extension<Arc<dyn Store>>,
    identity: Extension<Arc<Identity>>,
    payload: Option<Json<ResendConfirmationRequest>>,
) -> StatusCode {
    let Some(Json(request)) = payload else {
        return StatusCode::NO_CONTENT;
    };

    match identity
        .resend_confirmation(store.0.as_ref(), &request.email)
        .await
    {
        Ok(Some(delivery)) => info!(delivery = delivery.as_str(), "confirmation resent"),
        Ok(None) => {}
        Err(err) => error!("Failed to resend confirmation: {err}"),
    }

    StatusCode::NO_CONTENT
}
