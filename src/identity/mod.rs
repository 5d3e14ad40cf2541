//! Token-mediated identity lifecycle.
//!
//! A user is created inactive at registration and becomes active exactly once,
//! by redeeming a signup-confirmation [`one_time`] token. Login issues a signed
//! [`session`] token; logout puts it on the denylist. The [`guard`] turns a
//! presented bearer token into an active [`Principal`].

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::store::Transaction;

pub mod error;
pub mod guard;
pub mod hasher;
pub mod lifecycle;
pub mod one_time;
pub mod session;
pub mod validation;

pub use error::{GuardError, HashError, IdentityError, SessionError, TokenError, ValidationError};
pub use guard::{authorize, Principal};
pub use hasher::{Argon2Hasher, CredentialHasher};
pub use lifecycle::{Identity, PublicUser, Registered, Registration, SessionGrant};
pub use one_time::OneTimeTokens;
pub use session::{RevokeOutcome, SessionClaims, SessionIssuer};

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
        })
}

/// Roll back a transaction whose outcome no longer matters.
pub(crate) async fn discard(tx: Box<dyn Transaction>) {
    if let Err(err) = tx.rollback().await {
        debug!("rollback failed: {err}");
    }
}
