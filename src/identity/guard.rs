use tracing::debug;

use super::{
    discard,
    error::GuardError,
    session::{self, SessionClaims, SessionIssuer},
};
use crate::store::{Store, User, UserFilter};

/// Active user behind a verified, unrevoked bearer token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: User,
    pub token: String,
    pub claims: SessionClaims,
}

/// Resolve a bearer token into an active principal.
///
/// Signature, expiry and denylist failures as well as an unknown subject are
/// all [`GuardError::Unauthorized`]; an existing but inactive account is
/// [`GuardError::Forbidden`].
///
/// # Errors
/// See above, plus [`GuardError::Storage`] when the store is unreachable.
pub async fn authorize(
    store: &dyn Store,
    sessions: &SessionIssuer,
    bearer: &str,
) -> Result<Principal, GuardError> {
    let claims = sessions.verify(bearer).map_err(|err| {
        debug!("bearer rejected: {err}");
        GuardError::Unauthorized
    })?;

    let mut tx = store.begin().await?;
    let revoked = session::is_revoked(tx.as_mut(), bearer).await?;
    let user = if revoked {
        None
    } else {
        tx.find_user(UserFilter::Username(&claims.sub)).await?
    };
    discard(tx).await;

    if revoked {
        debug!("bearer is on the denylist");
        return Err(GuardError::Unauthorized);
    }
    let user = user.ok_or(GuardError::Unauthorized)?;
    if !user.is_active {
        return Err(GuardError::Forbidden);
    }

    Ok(Principal {
        user,
        token: bearer.to_string(),
        claims,
    })
}
