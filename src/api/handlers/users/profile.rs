use axum::{extract::Extension, http::HeaderMap, Json};
use std::sync::Arc;
use tracing::instrument;

use crate::api::handlers::{require_principal, ApiError, ErrorDetail};
use crate::identity::{Identity, PublicUser};
use crate::store::Store;

#[utoipa::path(
    get,
    path = "/users/me",
    responses(
        (status = 200, description = "The authenticated user", body = PublicUser),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorDetail),
        (status = 403, description = "Inactive user", body = ErrorDetail)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn me(
    headers: HeaderMap,
    store: Extension<Arc<dyn Store>>,
    identity: Extension<Arc<Identity>>,
) -> Result<Json<PublicUser>, ApiError> {
    let principal = require_principal(&headers, store.0.as_ref(), &identity).await?;
    Ok(Json(PublicUser::from(&principal.user)))
}

#[utoipa::path(
    get,
    path = "/users/all",
    responses(
        (status = 200, description = "All active users", body = [PublicUser])
    ),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn all(
    store: Extension<Arc<dyn Store>>,
    identity: Extension<Arc<Identity>>,
) -> Result<Json<Vec<PublicUser>>, ApiError> {
    Ok(Json(identity.list_active(store.0.as_ref()).await?))
}
