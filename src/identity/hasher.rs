//! Argon2id password hashing.
//!
//! Hashing and verification are CPU bound and run on the blocking pool.

use argon2::{
    password_hash::SaltString, Algorithm, Argon2, Params, PasswordHash, PasswordHasher,
    PasswordVerifier, Version,
};
use async_trait::async_trait;
use rand::rngs::OsRng;
use tokio::task::spawn_blocking;

use super::error::HashError;

#[async_trait]
pub trait CredentialHasher: Send + Sync {
    /// Salted one-way digest in PHC string format.
    async fn hash(&self, plaintext: &str) -> Result<String, HashError>;

    /// `false` on mismatch and on a digest that does not parse.
    async fn verify(&self, plaintext: &str, digest: &str) -> bool;

    /// Spend one verification against a fixed digest, so a lookup miss costs
    /// the same as a wrong password.
    async fn verify_dummy(&self, plaintext: &str);
}

#[derive(Clone)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
    dummy_digest: String,
}

impl std::fmt::Debug for Argon2Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argon2Hasher").finish_non_exhaustive()
    }
}

impl Argon2Hasher {
    /// # Errors
    /// Returns an error if the dummy digest cannot be computed with `params`.
    pub fn new(params: Params) -> Result<Self, HashError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let dummy_digest = hash_with(&argon2, "taskpass-dummy-credential")?;
        Ok(Self {
            argon2,
            dummy_digest,
        })
    }

    /// Library default cost (19 MiB, 2 passes, 1 lane).
    ///
    /// # Errors
    /// See [`Argon2Hasher::new`].
    pub fn recommended() -> Result<Self, HashError> {
        Self::new(Params::default())
    }
}

fn hash_with(argon2: &Argon2<'_>, plaintext: &str) -> Result<String, HashError> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| HashError::Hash(err.to_string()))
}

fn verify_with(argon2: &Argon2<'_>, plaintext: &str, digest: &str) -> bool {
    PasswordHash::new(digest).is_ok_and(|parsed| {
        argon2
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    })
}

#[async_trait]
impl CredentialHasher for Argon2Hasher {
    async fn hash(&self, plaintext: &str) -> Result<String, HashError> {
        let argon2 = self.argon2.clone();
        let plaintext = plaintext.to_owned();
        spawn_blocking(move || hash_with(&argon2, &plaintext)).await?
    }

    async fn verify(&self, plaintext: &str, digest: &str) -> bool {
        let argon2 = self.argon2.clone();
        let plaintext = plaintext.to_owned();
        let digest = digest.to_owned();
        spawn_blocking(move || verify_with(&argon2, &plaintext, &digest))
            .await
            .unwrap_or(false)
    }

    async fn verify_dummy(&self, plaintext: &str) {
        let digest = self.dummy_digest.clone();
        let _ = self.verify(plaintext, &digest).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    fn fast() -> Result<Argon2Hasher> {
        let params = Params::new(8, 1, 1, None).map_err(|err| anyhow!(err.to_string()))?;
        Ok(Argon2Hasher::new(params)?)
    }

    #[tokio::test]
    async fn hash_then_verify() -> Result<()> {
        let hasher = fast()?;
        let digest = hasher.hash("Abcdefgh1").await?;
        assert!(digest.starts_with("$argon2id$"));
        assert!(hasher.verify("Abcdefgh1", &digest).await);
        assert!(!hasher.verify("Abcdefgh2", &digest).await);
        Ok(())
    }

    #[tokio::test]
    async fn digests_are_salted() -> Result<()> {
        let hasher = fast()?;
        let first = hasher.hash("Abcdefgh1").await?;
        let second = hasher.hash("Abcdefgh1").await?;
        assert_ne!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_digest_does_not_verify() -> Result<()> {
        let hasher = fast()?;
        assert!(!hasher.verify("Abcdefgh1", "not-a-phc-string").await);
        hasher.verify_dummy("Abcdefgh1").await;
        Ok(())
    }
}
