//! In-process store with database-like constraint semantics.
//!
//! `begin` copies the shared state into a private snapshot. Reads see the
//! snapshot plus the transaction's own writes; writes are applied to the
//! snapshot immediately (so constraint failures show up on the write) and
//! buffered. `commit` replays the buffer against the current shared state,
//! re-checking every constraint, so a transaction that lost a race fails on
//! commit the way a concurrent Postgres insert would. A buffered delete that
//! no longer finds every row it removed from the snapshot fails with
//! [`StoreError::Conflict`], so a token cannot be consumed twice.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    Constraint, OneTimeToken, RevokedSessionToken, Store, StoreError, TokenFilter, Transaction,
    User, UserFilter,
};

#[derive(Debug, Clone, Default)]
struct State {
    users: Vec<User>,
    tokens: Vec<OneTimeToken>,
    revoked: Vec<RevokedSessionToken>,
}

/// Buffered write. Deletes are resolved to concrete token values at write
/// time, so rows inserted by other transactions afterwards are left alone.
#[derive(Debug, Clone)]
enum Write {
    InsertUser(User),
    ActivateUser(String),
    InsertToken(OneTimeToken),
    DeleteTokens(Vec<String>),
    InsertRevoked(RevokedSessionToken),
    PruneRevoked(i64),
}

impl State {
    fn apply(&mut self, write: &Write) -> Result<u64, StoreError> {
        match write {
            Write::InsertUser(user) => {
                if self.users.iter().any(|u| u.username == user.username) {
                    return Err(StoreError::UniqueViolation(Constraint::UserUsername));
                }
                if self.users.iter().any(|u| u.email == user.email) {
                    return Err(StoreError::UniqueViolation(Constraint::UserEmail));
                }
                self.users.push(user.clone());
                Ok(1)
            }
            Write::ActivateUser(email) => {
                let mut updated = 0;
                for user in self.users.iter_mut().filter(|u| &u.email == email) {
                    user.is_active = true;
                    updated += 1;
                }
                Ok(updated)
            }
            Write::InsertToken(token) => {
                if self.tokens.iter().any(|t| t.token == token.token) {
                    return Err(StoreError::UniqueViolation(Constraint::TokenValue));
                }
                if self
                    .tokens
                    .iter()
                    .any(|t| t.owner_email == token.owner_email && t.purpose == token.purpose)
                {
                    return Err(StoreError::UniqueViolation(Constraint::TokenOwnerPurpose));
                }
                self.tokens.push(token.clone());
                Ok(1)
            }
            Write::DeleteTokens(values) => {
                let before = self.tokens.len();
                self.tokens.retain(|t| !values.contains(&t.token));
                Ok(count(before - self.tokens.len()))
            }
            Write::InsertRevoked(entry) => {
                if self.revoked.iter().any(|r| r.token == entry.token) {
                    return Err(StoreError::UniqueViolation(Constraint::RevokedToken));
                }
                self.revoked.push(entry.clone());
                Ok(1)
            }
            Write::PruneRevoked(now_unix) => {
                let before = self.revoked.len();
                self.revoked.retain(|r| r.expires_at_unix > *now_unix);
                Ok(count(before - self.revoked.len()))
            }
        }
    }
}

fn count(rows: usize) -> u64 {
    u64::try_from(rows).unwrap_or(u64::MAX)
}

/// Shared in-memory backend; clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let snapshot = self.state.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.state),
            snapshot,
            writes: Vec::new(),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<State>>,
    snapshot: State,
    writes: Vec<Write>,
}

impl MemoryTransaction {
    fn write(&mut self, write: Write) -> Result<u64, StoreError> {
        let affected = self.snapshot.apply(&write)?;
        self.writes.push(write);
        Ok(affected)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn user_exists(&mut self, filter: UserFilter<'_>) -> Result<bool, StoreError> {
        Ok(self.snapshot.users.iter().any(|u| filter.matches(u)))
    }

    async fn find_user(&mut self, filter: UserFilter<'_>) -> Result<Option<User>, StoreError> {
        Ok(self
            .snapshot
            .users
            .iter()
            .find(|u| filter.matches(u))
            .cloned())
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.write(Write::InsertUser(user.clone())).map(|_| ())
    }

    async fn activate_user(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        if self.write(Write::ActivateUser(email.to_string()))? == 0 {
            return Ok(None);
        }
        self.find_user(UserFilter::Email(email)).await
    }

    async fn list_active_users(&mut self) -> Result<Vec<User>, StoreError> {
        Ok(self
            .snapshot
            .users
            .iter()
            .filter(|u| u.is_active)
            .cloned()
            .collect())
    }

    async fn token_exists(&mut self, filter: TokenFilter<'_>) -> Result<bool, StoreError> {
        Ok(self.snapshot.tokens.iter().any(|t| filter.matches(t)))
    }

    async fn find_token(
        &mut self,
        filter: TokenFilter<'_>,
    ) -> Result<Option<OneTimeToken>, StoreError> {
        Ok(self
            .snapshot
            .tokens
            .iter()
            .find(|t| filter.matches(t))
            .cloned())
    }

    async fn insert_token(&mut self, token: &OneTimeToken) -> Result<(), StoreError> {
        self.write(Write::InsertToken(token.clone())).map(|_| ())
    }

    async fn delete_tokens(&mut self, filter: TokenFilter<'_>) -> Result<u64, StoreError> {
        let values: Vec<String> = self
            .snapshot
            .tokens
            .iter()
            .filter(|t| filter.matches(t))
            .map(|t| t.token.clone())
            .collect();
        self.write(Write::DeleteTokens(values))
    }

    async fn insert_revoked(&mut self, entry: &RevokedSessionToken) -> Result<(), StoreError> {
        self.write(Write::InsertRevoked(entry.clone())).map(|_| ())
    }

    async fn is_revoked(&mut self, token: &str) -> Result<bool, StoreError> {
        Ok(self.snapshot.revoked.iter().any(|r| r.token == token))
    }

    async fn prune_revoked(&mut self, now_unix: i64) -> Result<u64, StoreError> {
        self.write(Write::PruneRevoked(now_unix))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut shared = self.shared.lock().await;
        let mut next = shared.clone();
        for write in &self.writes {
            let affected = next.apply(write)?;
            if let Write::DeleteTokens(values) = write {
                if affected < count(values.len()) {
                    return Err(StoreError::Conflict("one-time token removed concurrently"));
                }
            }
        }
        *shared = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
