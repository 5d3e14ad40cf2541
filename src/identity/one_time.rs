//! Single-use, purpose-scoped tokens proving control of an email address.
//!
//! Per `(owner, purpose)` a token is absent, live, or gone: consumed by a
//! successful [`OneTimeTokens::validate`] or superseded by a newer
//! [`OneTimeTokens::issue`]. Consumption deletes the row, so a replay fails
//! lookup instead of reporting "already used".

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, instrument};

use super::{discard, error::TokenError, unix_now};
use crate::store::{OneTimeToken, Store, StoreError, TokenFilter, TokenPurpose, Transaction};

const TOKEN_BYTES: usize = 32;
const ISSUE_ATTEMPTS: u32 = 5;

pub const DEFAULT_TTL_SECONDS: i64 = 86_400;

/// Whether any row matches `filter`.
///
/// # Errors
/// Propagates storage failures.
pub async fn exists(tx: &mut dyn Transaction, filter: TokenFilter<'_>) -> Result<bool, StoreError> {
    tx.token_exists(filter).await
}

/// Delete every row matching `filter`, returning how many went away.
///
/// # Errors
/// Propagates storage failures.
pub async fn invalidate(
    tx: &mut dyn Transaction,
    filter: TokenFilter<'_>,
) -> Result<u64, StoreError> {
    tx.delete_tokens(filter).await
}

/// A random value no row currently holds, for any purpose.
///
/// # Errors
/// Returns an error if the OS RNG fails or the store cannot be read.
pub async fn generate_unique(tx: &mut dyn Transaction) -> Result<String, TokenError> {
    generate_unique_from(tx, random_token).await
}

async fn generate_unique_from<F>(tx: &mut dyn Transaction, mut next: F) -> Result<String, TokenError>
where
    F: FnMut() -> Result<String, TokenError> + Send,
{
    loop {
        let candidate = next()?;
        if !tx.token_exists(TokenFilter::Value(&candidate)).await? {
            return Ok(candidate);
        }
        debug!("generated token collides with a live one, drawing again");
    }
}

fn random_token() -> Result<String, TokenError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[derive(Debug, Clone, Copy)]
pub struct OneTimeTokens {
    ttl_seconds: i64,
}

impl Default for OneTimeTokens {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_SECONDS)
    }
}

impl OneTimeTokens {
    #[must_use]
    pub fn new(ttl_seconds: i64) -> Self {
        Self { ttl_seconds }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Replace any live token for `(owner, purpose)` with a fresh one.
    ///
    /// Each attempt deletes and inserts inside one transaction. When a
    /// concurrent issuer wins the `(owner, purpose)` constraint, or removes
    /// the row being superseded, the attempt is rolled back and repeated.
    ///
    /// # Errors
    /// [`StoreError::RetriesExhausted`] once every attempt lost a race, or any
    /// other storage failure.
    #[instrument(skip(self, store))]
    pub async fn issue(
        &self,
        store: &dyn Store,
        owner: &str,
        purpose: TokenPurpose,
    ) -> Result<OneTimeToken, TokenError> {
        for attempt in 1..=ISSUE_ATTEMPTS {
            let mut tx = store.begin().await?;
            let outcome = match supersede(tx.as_mut(), owner, purpose).await {
                Ok(token) => tx.commit().await.map(|()| token).map_err(TokenError::from),
                Err(err) => {
                    discard(tx).await;
                    Err(err)
                }
            };

            match outcome {
                Ok(token) => return Ok(token),
                Err(TokenError::Storage(err)) if err.is_lost_race() => {
                    debug!(attempt, "token issue lost a race ({err}), retrying");
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::RetriesExhausted {
            operation: "issue one-time token",
            attempts: ISSUE_ATTEMPTS,
        }
        .into())
    }

    /// Check a presented token and consume it.
    ///
    /// The row is deleted inside `tx`; if a concurrent transaction consumed it
    /// first, committing `tx` fails with [`StoreError::Conflict`].
    ///
    /// # Errors
    /// [`TokenError::NotFound`] when `(owner, token)` matches nothing or the
    /// row was issued for another purpose, [`TokenError::Expired`] when it is
    /// flagged or older than the TTL.
    pub async fn validate(
        &self,
        tx: &mut dyn Transaction,
        token: &str,
        owner: &str,
        purpose: TokenPurpose,
    ) -> Result<OneTimeToken, TokenError> {
        self.validate_at(tx, token, owner, purpose, unix_now()).await
    }

    async fn validate_at(
        &self,
        tx: &mut dyn Transaction,
        token: &str,
        owner: &str,
        purpose: TokenPurpose,
        now_unix: i64,
    ) -> Result<OneTimeToken, TokenError> {
        let row = tx
            .find_token(TokenFilter::OwnerAndValue {
                email: owner,
                token,
            })
            .await?
            .filter(|row| row.purpose == purpose)
            .ok_or(TokenError::NotFound)?;

        if row.is_expired(now_unix, self.ttl_seconds) {
            return Err(TokenError::Expired);
        }

        // Zero rows means a concurrent validation committed first.
        if invalidate(tx, TokenFilter::Value(token)).await? == 0 {
            return Err(TokenError::NotFound);
        }

        Ok(row)
    }
}

async fn supersede(
    tx: &mut dyn Transaction,
    owner: &str,
    purpose: TokenPurpose,
) -> Result<OneTimeToken, TokenError> {
    let superseded = invalidate(
        tx,
        TokenFilter::Owner {
            email: owner,
            purpose,
        },
    )
    .await?;
    if superseded > 0 {
        debug!(superseded, "superseded live token");
    }

    let token = OneTimeToken {
        token: generate_unique(tx).await?,
        purpose,
        owner_email: owner.to_string(),
        created_at_unix: unix_now(),
        expired: false,
    };
    tx.insert_token(&token).await?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::{RacingStore, Rival};
    use crate::store::MemoryStore;
    use anyhow::Result;

    const OWNER: &str = "jane@x.com";
    const SIGNUP: TokenPurpose = TokenPurpose::SignupConfirmation;

    fn row(token: &str, created_at_unix: i64) -> OneTimeToken {
        OneTimeToken {
            token: token.to_string(),
            purpose: SIGNUP,
            owner_email: OWNER.to_string(),
            created_at_unix,
            expired: false,
        }
    }

    #[test]
    fn random_tokens_are_url_safe() -> Result<()> {
        let token = random_token()?;
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        Ok(())
    }

    #[tokio::test]
    async fn generation_skips_live_values() -> Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;
        tx.insert_token(&row("taken", unix_now())).await?;

        let mut draws = vec!["fresh".to_string(), "taken".to_string()];
        let token = generate_unique_from(tx.as_mut(), || Ok(draws.pop().unwrap_or_default())).await?;
        assert_eq!(token, "fresh");
        Ok(())
    }

    #[tokio::test]
    async fn validated_token_cannot_be_replayed() -> Result<()> {
        let store = MemoryStore::new();
        let tokens = OneTimeTokens::default();
        let issued = tokens.issue(&store, OWNER, SIGNUP).await?;

        let mut tx = store.begin().await?;
        let consumed = tokens.validate(tx.as_mut(), &issued.token, OWNER, SIGNUP).await?;
        assert_eq!(consumed.token, issued.token);
        tx.commit().await?;

        let mut tx = store.begin().await?;
        let replay = tokens.validate(tx.as_mut(), &issued.token, OWNER, SIGNUP).await;
        assert!(matches!(replay, Err(TokenError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn racing_validations_consume_once() -> Result<()> {
        let store = MemoryStore::new();
        let tokens = OneTimeTokens::default();
        let issued = tokens.issue(&store, OWNER, SIGNUP).await?;

        let mut first = store.begin().await?;
        let mut second = store.begin().await?;
        assert!(tokens.validate(first.as_mut(), &issued.token, OWNER, SIGNUP).await.is_ok());
        assert!(tokens.validate(second.as_mut(), &issued.token, OWNER, SIGNUP).await.is_ok());

        first.commit().await?;
        let late = second.commit().await;
        assert!(matches!(late, Err(StoreError::Conflict(_))));

        let mut tx = store.begin().await?;
        assert!(!exists(tx.as_mut(), TokenFilter::Value(&issued.token)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn issue_retries_after_superseded_row_vanishes() -> Result<()> {
        let inner = MemoryStore::new();
        let tokens = OneTimeTokens::default();
        let earlier = tokens.issue(&inner, OWNER, SIGNUP).await?;

        let store = RacingStore::over(inner, Rival::Consume(earlier.token.clone()));
        let reissued = tokens.issue(&store, OWNER, SIGNUP).await?;

        let mut tx = store.inner.begin().await?;
        assert!(exists(tx.as_mut(), TokenFilter::Value(&reissued.token)).await?);
        assert!(!exists(tx.as_mut(), TokenFilter::Value(&earlier.token)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn reissue_supersedes_previous_token() -> Result<()> {
        let store = MemoryStore::new();
        let tokens = OneTimeTokens::default();
        let first = tokens.issue(&store, OWNER, SIGNUP).await?;
        let second = tokens.issue(&store, OWNER, SIGNUP).await?;
        assert_ne!(first.token, second.token);

        let mut tx = store.begin().await?;
        let stale = tokens.validate(tx.as_mut(), &first.token, OWNER, SIGNUP).await;
        assert!(matches!(stale, Err(TokenError::NotFound)));
        assert!(tokens.validate(tx.as_mut(), &second.token, OWNER, SIGNUP).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn other_owner_or_purpose_is_not_found() -> Result<()> {
        let store = MemoryStore::new();
        let tokens = OneTimeTokens::default();
        let issued = tokens.issue(&store, OWNER, SIGNUP).await?;

        let mut tx = store.begin().await?;
        let wrong_owner = tokens.validate(tx.as_mut(), &issued.token, "john@x.com", SIGNUP).await;
        assert!(matches!(wrong_owner, Err(TokenError::NotFound)));
        let wrong_purpose = tokens
            .validate(tx.as_mut(), &issued.token, OWNER, TokenPurpose::PasswordReset)
            .await;
        assert!(matches!(wrong_purpose, Err(TokenError::NotFound)));
        assert!(exists(tx.as_mut(), TokenFilter::Value(&issued.token)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_by_flag_or_age() -> Result<()> {
        let store = MemoryStore::new();
        let tokens = OneTimeTokens::new(60);
        let mut tx = store.begin().await?;
        tx.insert_token(&row("aged", 1_000)).await?;

        let fresh = tokens.validate_at(tx.as_mut(), "aged", OWNER, SIGNUP, 1_059).await;
        assert!(fresh.is_ok());

        tx.insert_token(&OneTimeToken {
            expired: true,
            ..row("flagged", 1_000)
        })
        .await?;
        let flagged = tokens.validate_at(tx.as_mut(), "flagged", OWNER, SIGNUP, 1_001).await;
        assert!(matches!(flagged, Err(TokenError::Expired)));
        invalidate(tx.as_mut(), TokenFilter::Value("flagged")).await?;

        tx.insert_token(&row("stale", 1_000)).await?;
        let stale = tokens.validate_at(tx.as_mut(), "stale", OWNER, SIGNUP, 1_060).await;
        assert!(matches!(stale, Err(TokenError::Expired)));
        Ok(())
    }

    #[tokio::test]
    async fn issue_retries_after_losing_supersede_race() -> Result<()> {
        let store = RacingStore::with_rival(Rival::Token(row("rival", unix_now())));
        let tokens = OneTimeTokens::default();
        let issued = tokens.issue(&store, OWNER, SIGNUP).await?;

        let mut tx = store.inner.begin().await?;
        assert!(!exists(tx.as_mut(), TokenFilter::Value("rival")).await?);
        assert!(exists(tx.as_mut(), TokenFilter::Value(&issued.token)).await?);
        assert!(
            exists(
                tx.as_mut(),
                TokenFilter::Owner {
                    email: OWNER,
                    purpose: SIGNUP
                }
            )
            .await?
        );
        Ok(())
    }
}
