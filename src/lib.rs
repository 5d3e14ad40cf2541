//! # Taskpass (identity lifecycle and session authority)
//!
//! `taskpass` owns the accounts of the task list service: registration with an
//! emailed confirmation link, password login, bearer session tokens and their
//! revocation.
//!
//! ## Lifecycle
//!
//! - **Registration** creates an inactive user with a derived `@handle` and
//!   mails a single-use signup link.
//! - **Confirmation** redeems the link exactly once and activates the user.
//! - **Login** checks an Argon2 digest and signs an HS256 session token.
//! - **Logout** puts the presented token on a denylist until it expires.
//!
//! ## Storage
//!
//! Every read and write goes through a [`store::Store`] transaction. Postgres
//! is the production backend; [`store::MemoryStore`] backs the test suite and
//! enforces the same uniqueness constraints.

pub mod api;
pub mod cli;
pub mod identity;
pub mod notify;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}
