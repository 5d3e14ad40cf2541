//! HS256 bearer tokens and the revocation denylist.
//!
//! A token is accepted only while its signature and `exp` check out *and* it
//! is absent from the denylist. Denylist rows keep the token's own expiry so
//! they can be pruned once the token would be rejected anyway.

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use super::{error::SessionError, unix_now};
use crate::store::{Constraint, RevokedSessionToken, Store, StoreError, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Username of the holder.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
}

pub struct SessionIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_seconds: i64,
}

impl std::fmt::Debug for SessionIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIssuer")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl SessionIssuer {
    pub const DEFAULT_TTL_SECONDS: i64 = 1_800;

    #[must_use]
    pub fn new(secret: &SecretString, ttl_seconds: i64) -> Self {
        let key = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            ttl_seconds,
        }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Sign a token for `subject` with the configured TTL.
    ///
    /// # Errors
    /// Returns [`SessionError::Signing`] if encoding fails.
    pub fn issue(&self, subject: &str) -> Result<(String, SessionClaims), SessionError> {
        self.issue_with_ttl(subject, self.ttl_seconds)
    }

    /// # Errors
    /// Returns [`SessionError::Signing`] if encoding fails.
    pub fn issue_with_ttl(
        &self,
        subject: &str,
        ttl_seconds: i64,
    ) -> Result<(String, SessionClaims), SessionError> {
        let iat = unix_now();
        let claims = SessionClaims {
            sub: subject.to_string(),
            iat,
            exp: iat.saturating_add(ttl_seconds),
            jti: Ulid::new().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(SessionError::Signing)?;
        Ok((token, claims))
    }

    /// Check signature and expiry; the denylist is not consulted here.
    ///
    /// # Errors
    /// [`SessionError::Expired`] once `exp` has passed, [`SessionError::Malformed`]
    /// for anything else that fails to decode.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, SessionError> {
        decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => SessionError::Expired,
                _ => SessionError::Malformed,
            })
    }
}

/// Put `token` on the denylist. A token that is already there is reported,
/// not treated as a failure.
///
/// # Errors
/// Propagates storage failures other than the duplicate.
pub async fn revoke(
    tx: &mut dyn Transaction,
    token: &str,
    email: &str,
    expires_at_unix: i64,
) -> Result<RevokeOutcome, StoreError> {
    if tx.is_revoked(token).await? {
        return Ok(RevokeOutcome::AlreadyRevoked);
    }
    let entry = RevokedSessionToken {
        token: token.to_string(),
        email: email.to_string(),
        expires_at_unix,
    };
    match tx.insert_revoked(&entry).await {
        Ok(()) => Ok(RevokeOutcome::Revoked),
        Err(StoreError::UniqueViolation(Constraint::RevokedToken)) => {
            Ok(RevokeOutcome::AlreadyRevoked)
        }
        Err(err) => Err(err),
    }
}

/// # Errors
/// Propagates storage failures.
pub async fn is_revoked(tx: &mut dyn Transaction, token: &str) -> Result<bool, StoreError> {
    tx.is_revoked(token).await
}

/// Drop denylist rows whose token has expired by `now_unix`.
///
/// # Errors
/// Propagates storage failures.
pub async fn prune(store: &dyn Store, now_unix: i64) -> Result<u64, StoreError> {
    let mut tx = store.begin().await?;
    let pruned = tx.prune_revoked(now_unix).await?;
    tx.commit().await?;
    if pruned > 0 {
        debug!(pruned, "pruned expired denylist entries");
    }
    Ok(pruned)
}
