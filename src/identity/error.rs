use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("password hashing task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// First registration rule that failed; the message is returned to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Name must not be empty")]
    EmptyName,
    #[error("Surname must not be empty")]
    EmptySurname,
    #[error("Invalid email address")]
    InvalidEmail,
    #[error("Password must be at least 9 characters long")]
    PasswordTooShort,
    #[error("Password must contain at least one lowercase letter")]
    PasswordMissingLowercase,
    #[error("Password must contain at least one uppercase letter")]
    PasswordMissingUppercase,
    #[error("Password must contain at least one digit")]
    PasswordMissingDigit,
    #[error("Passwords do not match")]
    PasswordMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Never issued, already consumed, owned by someone else or issued for
    /// another purpose.
    #[error("This token does not exist or belongs to another user!")]
    NotFound,
    #[error("Signature expired")]
    Expired,
    #[error("failed to gather token entropy")]
    Entropy(#[from] rand::Error),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed session token")]
    Malformed,
    #[error("session token expired")]
    Expired,
    #[error("failed to sign session token: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("User with provided email exists!")]
    Conflict,
    #[error("{0}")]
    Token(TokenError),
    #[error("Incorrect username or password")]
    NotAuthenticated,
    #[error("No such user with this email address!")]
    NoSuchUser,
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for IdentityError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Storage(err) => Self::Storage(err),
            TokenError::Entropy(err) => Self::Internal(err.to_string()),
            other => Self::Token(other),
        }
    }
}

impl From<HashError> for IdentityError {
    fn from(err: HashError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<SessionError> for IdentityError {
    fn from(err: SessionError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Could not validate credentials")]
    Unauthorized,
    #[error("Inactive user")]
    Forbidden,
    #[error(transparent)]
    Storage(#[from] StoreError),
}
