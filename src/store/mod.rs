//! Persistence boundary for users, one-time tokens and the session denylist.
//!
//! Every logical operation opens a [`Transaction`] through [`Store::begin`] and
//! runs all of its reads and writes inside it. Uniqueness is enforced by the
//! backend, not by callers: a violated constraint surfaces as
//! [`StoreError::UniqueViolation`] either on the write itself or on commit, and
//! the identity layer decides whether to retry.
//!
//! Two backends exist: [`postgres::PgStore`] for deployments and
//! [`memory::MemoryStore`], which keeps the same constraint semantics in
//! process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Flat role set; new users only ever receive [`Role::User`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "role_user",
            Self::Admin => "role_admin",
            Self::SuperAdmin => "role_superadmin",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "role_user" => Ok(Self::User),
            "role_admin" => Ok(Self::Admin),
            "role_superadmin" => Ok(Self::SuperAdmin),
            other => Err(UnknownVariant::new("role", other)),
        }
    }
}

/// What a one-time token proves control of an email address for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenPurpose {
    SignupConfirmation,
    EmailChange,
    PasswordReset,
}

impl TokenPurpose {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignupConfirmation => "su",
            Self::EmailChange => "ce",
            Self::PasswordReset => "pr",
        }
    }
}

impl FromStr for TokenPurpose {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "su" => Ok(Self::SignupConfirmation),
            "ce" => Ok(Self::EmailChange),
            "pr" => Ok(Self::PasswordReset),
            other => Err(UnknownVariant::new("token purpose", other)),
        }
    }
}

/// A stored value that does not map onto any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub name: String,
    pub surname: String,
    pub hashed_password: String,
    pub is_active: bool,
    pub roles: Vec<Role>,
}

impl User {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    #[must_use]
    pub fn is_superadmin(&self) -> bool {
        self.roles.contains(&Role::SuperAdmin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimeToken {
    pub token: String,
    pub purpose: TokenPurpose,
    pub owner_email: String,
    pub created_at_unix: i64,
    pub expired: bool,
}

impl OneTimeToken {
    /// Expired when flagged, or once `ttl_seconds` have passed since creation.
    #[must_use]
    pub fn is_expired(&self, now_unix: i64, ttl_seconds: i64) -> bool {
        self.expired || now_unix.saturating_sub(self.created_at_unix) >= ttl_seconds
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedSessionToken {
    pub token: String,
    pub email: String,
    pub expires_at_unix: i64,
}

#[derive(Debug, Clone, Copy)]
pub enum UserFilter<'a> {
    Id(Uuid),
    Username(&'a str),
    Email(&'a str),
}

impl UserFilter<'_> {
    #[must_use]
    pub fn matches(&self, user: &User) -> bool {
        match *self {
            Self::Id(id) => user.id == id,
            Self::Username(username) => user.username == username,
            Self::Email(email) => user.email == email,
        }
    }
}

/// Lookup keys for one-time tokens: by owner and purpose, by raw value, or both.
#[derive(Debug, Clone, Copy)]
pub enum TokenFilter<'a> {
    Owner {
        email: &'a str,
        purpose: TokenPurpose,
    },
    Value(&'a str),
    OwnerAndValue {
        email: &'a str,
        token: &'a str,
    },
}

impl TokenFilter<'_> {
    #[must_use]
    pub fn matches(&self, row: &OneTimeToken) -> bool {
        match *self {
            Self::Owner { email, purpose } => row.owner_email == email && row.purpose == purpose,
            Self::Value(token) => row.token == token,
            Self::OwnerAndValue { email, token } => row.owner_email == email && row.token == token,
        }
    }
}

/// Named uniqueness constraints (see `sql/schema.sql`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    UserUsername,
    UserEmail,
    TokenValue,
    TokenOwnerPurpose,
    RevokedToken,
    Other(String),
}

impl Constraint {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "users_username_key" => Self::UserUsername,
            "users_email_key" => Self::UserEmail,
            "one_time_tokens_token_key" => Self::TokenValue,
            "one_time_tokens_owner_purpose_key" => Self::TokenOwnerPurpose,
            "revoked_session_tokens_token_key" => Self::RevokedToken,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::UserUsername => "users_username_key",
            Self::UserEmail => "users_email_key",
            Self::TokenValue => "one_time_tokens_token_key",
            Self::TokenOwnerPurpose => "one_time_tokens_owner_purpose_key",
            Self::RevokedToken => "revoked_session_tokens_token_key",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(Constraint),
    /// A row this transaction read or deleted was changed by a concurrent one.
    #[error("concurrent write conflict: {0}")]
    Conflict(&'static str),
    #[error("corrupt row: {0}")]
    Corrupt(#[from] UnknownVariant),
    #[error("gave up after {attempts} attempts: {operation}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    /// Unique violations and write conflicts: the operation can be retried
    /// in a fresh transaction.
    #[must_use]
    pub fn is_lost_race(&self) -> bool {
        matches!(self, Self::UniqueViolation(_) | Self::Conflict(_))
    }
}

/// Handle to a backend able to open transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction; dropping it without commit discards its writes.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Cheap connectivity check for `/health`.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Reads and writes scoped to one logical operation.
#[async_trait]
pub trait Transaction: Send {
    async fn user_exists(&mut self, filter: UserFilter<'_>) -> Result<bool, StoreError>;

    async fn find_user(&mut self, filter: UserFilter<'_>) -> Result<Option<User>, StoreError>;

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError>;

    /// Flip `is_active` on; returns the updated user, `None` if no user has `email`.
    async fn activate_user(&mut self, email: &str) -> Result<Option<User>, StoreError>;

    async fn list_active_users(&mut self) -> Result<Vec<User>, StoreError>;

    async fn token_exists(&mut self, filter: TokenFilter<'_>) -> Result<bool, StoreError>;

    async fn find_token(
        &mut self,
        filter: TokenFilter<'_>,
    ) -> Result<Option<OneTimeToken>, StoreError>;

    async fn insert_token(&mut self, token: &OneTimeToken) -> Result<(), StoreError>;

    /// Returns the number of rows removed.
    async fn delete_tokens(&mut self, filter: TokenFilter<'_>) -> Result<u64, StoreError>;

    async fn insert_revoked(&mut self, entry: &RevokedSessionToken) -> Result<(), StoreError>;

    async fn is_revoked(&mut self, token: &str) -> Result<bool, StoreError>;

    /// Remove denylist rows whose session token expired at or before `now_unix`.
    async fn prune_revoked(&mut self, now_unix: i64) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(owner: &str, value: &str, purpose: TokenPurpose) -> OneTimeToken {
        OneTimeToken {
            token: value.to_string(),
            purpose,
            owner_email: owner.to_string(),
            created_at_unix: 1_000,
            expired: false,
        }
    }

    #[test]
    fn purpose_storage_mapping() {
        for purpose in [
            TokenPurpose::SignupConfirmation,
            TokenPurpose::EmailChange,
            TokenPurpose::PasswordReset,
        ] {
            assert_eq!(purpose.as_str().parse::<TokenPurpose>(), Ok(purpose));
        }
        assert!("xx".parse::<TokenPurpose>().is_err());
    }

    #[test]
    fn role_storage_mapping() {
        assert_eq!("role_admin".parse::<Role>(), Ok(Role::Admin));
        assert_eq!(Role::SuperAdmin.as_str(), "role_superadmin");
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn token_filter_matches() {
        let row = token("a@x.com", "abc", TokenPurpose::SignupConfirmation);
        assert!(TokenFilter::Value("abc").matches(&row));
        assert!(TokenFilter::Owner {
            email: "a@x.com",
            purpose: TokenPurpose::SignupConfirmation
        }
        .matches(&row));
        assert!(!TokenFilter::Owner {
            email: "a@x.com",
            purpose: TokenPurpose::PasswordReset
        }
        .matches(&row));
        assert!(!TokenFilter::OwnerAndValue {
            email: "b@x.com",
            token: "abc"
        }
        .matches(&row));
    }

    #[test]
    fn token_expiry_uses_flag_and_ttl() {
        let mut row = token("a@x.com", "abc", TokenPurpose::SignupConfirmation);
        assert!(!row.is_expired(1_059, 60));
        assert!(row.is_expired(1_060, 60));
        row.expired = true;
        assert!(row.is_expired(1_000, 60));
    }

    #[test]
    fn constraint_names_round_trip() {
        for constraint in [
            Constraint::UserUsername,
            Constraint::UserEmail,
            Constraint::TokenValue,
            Constraint::TokenOwnerPurpose,
            Constraint::RevokedToken,
        ] {
            assert_eq!(Constraint::from_name(constraint.name()), constraint);
        }
        assert_eq!(
            Constraint::from_name("tasks_pkey"),
            Constraint::Other("tasks_pkey".to_string())
        );
    }
}
