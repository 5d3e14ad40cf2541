//! Registration, confirmation, login and logout.
//!
//! [`Identity`] holds the process-wide collaborators (hasher, session signer,
//! token policy, notifier). The store is passed to every operation, so each
//! call owns its transactions explicitly.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    discard,
    error::{IdentityError, TokenError},
    guard::Principal,
    hasher::CredentialHasher,
    one_time::OneTimeTokens,
    session::{self, RevokeOutcome, SessionClaims, SessionIssuer},
    validation::{normalize_email, username_base, validate_registration},
};
use crate::notify::{Delivery, MailContext, Notifier};
use crate::store::{
    Constraint, Role, Store, StoreError, TokenPurpose, Transaction, User, UserFilter,
};

const REGISTER_ATTEMPTS: u32 = 5;

/// User fields safe to hand to clients.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub username: String,
    pub is_active: bool,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            surname: user.surname.clone(),
            email: user.email.clone(),
            username: user.username.clone(),
            is_active: user.is_active,
        }
    }
}

pub struct Registration {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
}

#[derive(Debug, Clone)]
pub struct Registered {
    pub user: PublicUser,
    pub delivery: Delivery,
}

#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub access_token: String,
    pub claims: SessionClaims,
}

pub struct Identity {
    hasher: Arc<dyn CredentialHasher>,
    sessions: SessionIssuer,
    tokens: OneTimeTokens,
    notifier: Arc<dyn Notifier>,
    public_base_url: Url,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("sessions", &self.sessions)
            .field("tokens", &self.tokens)
            .field("public_base_url", &self.public_base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl Identity {
    #[must_use]
    pub fn new(
        hasher: Arc<dyn CredentialHasher>,
        sessions: SessionIssuer,
        tokens: OneTimeTokens,
        notifier: Arc<dyn Notifier>,
        public_base_url: Url,
    ) -> Self {
        Self {
            hasher,
            sessions,
            tokens,
            notifier,
            public_base_url,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionIssuer {
        &self.sessions
    }

    /// Create an inactive user and mail a confirmation link.
    ///
    /// Once the user row is committed, failing to issue the token or to mail
    /// it leaves the user in place; the outcome reports [`Delivery::Failed`]
    /// and a new link can be requested later.
    ///
    /// # Errors
    /// [`IdentityError::Validation`] for bad input, [`IdentityError::Conflict`]
    /// for a registered email, storage errors once retries are exhausted.
    #[instrument(skip_all)]
    pub async fn register(
        &self,
        store: &dyn Store,
        input: Registration,
    ) -> Result<Registered, IdentityError> {
        let email = validate_registration(
            &input.name,
            &input.surname,
            &input.email,
            &input.password,
            &input.password_confirm,
        )?;

        let mut tx = store.begin().await?;
        let taken = tx.user_exists(UserFilter::Email(&email)).await;
        discard(tx).await;
        if taken? {
            return Err(IdentityError::Conflict);
        }

        let hashed_password = self.hasher.hash(&input.password).await?;
        let user = insert_user(store, &input, &email, &hashed_password).await?;
        info!(username = %user.username, "user registered");

        let delivery = match self
            .tokens
            .issue(store, &email, TokenPurpose::SignupConfirmation)
            .await
        {
            Ok(token) => {
                self.send_token(TokenPurpose::SignupConfirmation, &email, &token.token)
                    .await
            }
            Err(err) => {
                warn!("no confirmation token for new user: {err}");
                Delivery::Failed
            }
        };

        Ok(Registered {
            user: PublicUser::from(&user),
            delivery,
        })
    }

    /// Redeem a signup token and activate its owner, both in one transaction.
    ///
    /// # Errors
    /// Token errors verbatim, [`IdentityError::NoSuchUser`] if the owner is
    /// gone (the token is then left untouched).
    #[instrument(skip(self, store, token))]
    pub async fn confirm(
        &self,
        store: &dyn Store,
        token: &str,
        email: &str,
    ) -> Result<PublicUser, IdentityError> {
        let email = normalize_email(email);
        let mut tx = store.begin().await?;
        match self.activate(tx.as_mut(), token, &email).await {
            Ok(user) => match tx.commit().await {
                Ok(()) => {
                    info!(username = %user.username, "email confirmed");
                    Ok(PublicUser::from(&user))
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!("confirmation lost to a concurrent one: {reason}");
                    Err(TokenError::NotFound.into())
                }
                Err(err) => Err(err.into()),
            },
            Err(err) => {
                discard(tx).await;
                Err(err)
            }
        }
    }

    async fn activate(
        &self,
        tx: &mut dyn Transaction,
        token: &str,
        email: &str,
    ) -> Result<User, IdentityError> {
        self.tokens
            .validate(tx, token, email, TokenPurpose::SignupConfirmation)
            .await?;
        tx.activate_user(email)
            .await?
            .ok_or(IdentityError::NoSuchUser)
    }

    /// Mail a fresh signup link to a registered but inactive address.
    ///
    /// Returns `None` without side effects for unknown or already active
    /// addresses, so callers can answer uniformly.
    ///
    /// # Errors
    /// Storage errors only.
    #[instrument(skip(self, store))]
    pub async fn resend_confirmation(
        &self,
        store: &dyn Store,
        email: &str,
    ) -> Result<Option<Delivery>, IdentityError> {
        let email = normalize_email(email);
        let mut tx = store.begin().await?;
        let user = tx.find_user(UserFilter::Email(&email)).await;
        discard(tx).await;

        match user? {
            Some(user) if !user.is_active => {
                let token = self
                    .tokens
                    .issue(store, &email, TokenPurpose::SignupConfirmation)
                    .await?;
                Ok(Some(
                    self.send_token(TokenPurpose::SignupConfirmation, &email, &token.token)
                        .await,
                ))
            }
            _ => {
                debug!("resend ignored for unknown or active address");
                Ok(None)
            }
        }
    }

    /// Check credentials and sign a session token for the username.
    ///
    /// # Errors
    /// [`IdentityError::NotAuthenticated`] for an unknown username, an
    /// inactive account and a wrong password alike.
    #[instrument(skip(self, store, password))]
    pub async fn login(
        &self,
        store: &dyn Store,
        username: &str,
        password: &str,
    ) -> Result<SessionGrant, IdentityError> {
        let mut tx = store.begin().await?;
        let user = tx.find_user(UserFilter::Username(username)).await;
        discard(tx).await;

        let Some(user) = user? else {
            self.hasher.verify_dummy(password).await;
            return Err(IdentityError::NotAuthenticated);
        };
        let verified = self.hasher.verify(password, &user.hashed_password).await;
        if !verified || !user.is_active {
            return Err(IdentityError::NotAuthenticated);
        }

        let (access_token, claims) = self.sessions.issue(&user.username)?;
        Ok(SessionGrant {
            access_token,
            claims,
        })
    }

    /// Revoke the principal's current token.
    ///
    /// # Errors
    /// Storage errors only; a token revoked twice is [`RevokeOutcome::AlreadyRevoked`].
    #[instrument(skip_all, fields(username = %principal.user.username))]
    pub async fn logout(
        &self,
        store: &dyn Store,
        principal: &Principal,
    ) -> Result<RevokeOutcome, IdentityError> {
        let mut tx = store.begin().await?;
        let outcome = session::revoke(
            tx.as_mut(),
            &principal.token,
            &principal.user.email,
            principal.claims.exp,
        )
        .await;

        match outcome {
            Ok(RevokeOutcome::Revoked) => match tx.commit().await {
                Ok(()) => Ok(RevokeOutcome::Revoked),
                Err(StoreError::UniqueViolation(Constraint::RevokedToken)) => {
                    Ok(RevokeOutcome::AlreadyRevoked)
                }
                Err(err) => Err(err.into()),
            },
            Ok(RevokeOutcome::AlreadyRevoked) => {
                discard(tx).await;
                Ok(RevokeOutcome::AlreadyRevoked)
            }
            Err(err) => {
                discard(tx).await;
                Err(err.into())
            }
        }
    }

    /// # Errors
    /// Storage errors only.
    pub async fn list_active(&self, store: &dyn Store) -> Result<Vec<PublicUser>, IdentityError> {
        let mut tx = store.begin().await?;
        let users = tx.list_active_users().await;
        discard(tx).await;
        Ok(users?.iter().map(PublicUser::from).collect())
    }

    async fn send_token(&self, purpose: TokenPurpose, email: &str, token: &str) -> Delivery {
        let context = MailContext::for_purpose(purpose);
        let message = match context.message(&self.public_base_url, email, token) {
            Ok(message) => message,
            Err(err) => {
                warn!("failed to build {} mail: {err}", purpose.as_str());
                return Delivery::Failed;
            }
        };

        match self.notifier.deliver(&message).await {
            Ok(delivery) => {
                debug!(delivery = delivery.as_str(), "{}", context.success_message);
                delivery
            }
            Err(err) => {
                warn!("failed to deliver {} mail: {err}", purpose.as_str());
                Delivery::Failed
            }
        }
    }
}

/// Insert with the first free username, regenerating it when a concurrent
/// registration claims the same one between lookup and commit.
async fn insert_user(
    store: &dyn Store,
    input: &Registration,
    email: &str,
    hashed_password: &str,
) -> Result<User, IdentityError> {
    for attempt in 1..=REGISTER_ATTEMPTS {
        let mut tx = store.begin().await?;
        let user = match derive_username(tx.as_mut(), email).await {
            Ok(username) => User {
                id: Uuid::now_v7(),
                username,
                email: email.to_string(),
                name: input.name.trim().to_string(),
                surname: input.surname.trim().to_string(),
                hashed_password: hashed_password.to_string(),
                is_active: false,
                roles: vec![Role::User],
            },
            Err(err) => {
                discard(tx).await;
                return Err(err.into());
            }
        };

        let outcome = match tx.insert_user(&user).await {
            Ok(()) => tx.commit().await,
            Err(err) => {
                discard(tx).await;
                Err(err)
            }
        };

        match outcome {
            Ok(()) => return Ok(user),
            Err(StoreError::UniqueViolation(Constraint::UserUsername)) => {
                debug!(attempt, username = %user.username, "username claimed concurrently, regenerating");
            }
            Err(StoreError::UniqueViolation(Constraint::UserEmail)) => {
                return Err(IdentityError::Conflict);
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(StoreError::RetriesExhausted {
        operation: "register user",
        attempts: REGISTER_ATTEMPTS,
    }
    .into())
}

/// `@local`, else `@local1`, `@local2`, ... whichever is free first.
async fn derive_username(tx: &mut dyn Transaction, email: &str) -> Result<String, StoreError> {
    let base = username_base(email);
    if !tx.user_exists(UserFilter::Username(&base)).await? {
        return Ok(base);
    }
    let mut suffix: u64 = 1;
    loop {
        let candidate = format!("{base}{suffix}");
        if !tx.user_exists(UserFilter::Username(&candidate)).await? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{
        error::{TokenError, ValidationError},
        guard::authorize,
        test_support::{identity, CapturingNotifier, RacingStore, Rival, TokenOutage},
        GuardError,
    };
    use crate::store::MemoryStore;
    use anyhow::{anyhow, Result};

    fn form(email: &str) -> Registration {
        Registration {
            name: "Jane".to_string(),
            surname: "Doe".to_string(),
            email: email.to_string(),
            password: "Abcdefgh1".to_string(),
            password_confirm: "Abcdefgh1".to_string(),
        }
    }

    fn rival_user(username: &str, email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            name: "Rival".to_string(),
            surname: "Doe".to_string(),
            hashed_password: "unused".to_string(),
            is_active: false,
            roles: vec![Role::User],
        }
    }

    async fn registered_and_confirmed(
        identity: &Identity,
        notifier: &CapturingNotifier,
        store: &dyn Store,
        email: &str,
    ) -> Result<PublicUser> {
        identity.register(store, form(email)).await?;
        let token = notifier.last_token().ok_or_else(|| anyhow!("no link mailed"))?;
        Ok(identity.confirm(store, &token, email).await?)
    }

    #[tokio::test]
    async fn registration_creates_inactive_user_and_mails_link() -> Result<()> {
        let store = MemoryStore::new();
        let notifier = Arc::new(CapturingNotifier::default());
        let identity = identity(notifier.clone())?;

        let registered = identity.register(&store, form("Jane@X.com")).await?;
        assert_eq!(registered.user.username, "@jane");
        assert_eq!(registered.user.email, "jane@x.com");
        assert_eq!(registered.user.id.get_version_num(), 7);
        assert!(!registered.user.is_active);
        assert_eq!(registered.delivery, Delivery::Sent);

        let message = notifier.last().ok_or_else(|| anyhow!("no mail"))?;
        assert_eq!(message.recipient, "jane@x.com");
        assert!(message
            .body
            .contains("http://127.0.0.1:8080/users/confirm_email_reg/"));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() -> Result<()> {
        let store = MemoryStore::new();
        let identity = identity(Arc::new(CapturingNotifier::default()))?;
        identity.register(&store, form("jane@x.com")).await?;
        let again = identity.register(&store, form("JANE@x.com")).await;
        assert!(matches!(again, Err(IdentityError::Conflict)));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_storage() -> Result<()> {
        let store = MemoryStore::new();
        let identity = identity(Arc::new(CapturingNotifier::default()))?;
        let mut input = form("jane@x.com");
        input.password = "alllowercase1".to_string();
        input.password_confirm = "alllowercase1".to_string();
        let result = identity.register(&store, input).await;
        assert!(matches!(
            result,
            Err(IdentityError::Validation(
                ValidationError::PasswordMissingUppercase
            ))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn colliding_local_parts_get_sequential_suffixes() -> Result<()> {
        let store = MemoryStore::new();
        let identity = identity(Arc::new(CapturingNotifier::default()))?;
        let (first, second) = tokio::join!(
            identity.register(&store, form("a@x.com")),
            identity.register(&store, form("a@y.com")),
        );
        let mut usernames = vec![first?.user.username, second?.user.username];
        usernames.sort();
        assert_eq!(usernames, vec!["@a".to_string(), "@a1".to_string()]);

        let third = identity.register(&store, form("a@z.com")).await?;
        assert_eq!(third.user.username, "@a2");
        Ok(())
    }

    #[tokio::test]
    async fn lost_username_race_regenerates() -> Result<()> {
        let store = RacingStore::with_rival(Rival::User(rival_user("@a", "a@y.com")));
        let user = insert_user(&store, &form("a@x.com"), "a@x.com", "hash").await?;
        assert_eq!(user.username, "@a1");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_email_claim_is_a_conflict() -> Result<()> {
        let store = RacingStore::with_rival(Rival::User(rival_user("@other", "jane@x.com")));
        let result = insert_user(&store, &form("jane@x.com"), "jane@x.com", "hash").await;
        assert!(matches!(result, Err(IdentityError::Conflict)));
        Ok(())
    }

    #[tokio::test]
    async fn confirmation_activates_once() -> Result<()> {
        let store = MemoryStore::new();
        let notifier = Arc::new(CapturingNotifier::default());
        let identity = identity(notifier.clone())?;
        identity.register(&store, form("jane@x.com")).await?;
        let token = notifier.last_token().ok_or_else(|| anyhow!("no link mailed"))?;

        let user = identity.confirm(&store, &token, "jane@x.com").await?;
        assert!(user.is_active);

        let replay = identity.confirm(&store, &token, "jane@x.com").await;
        assert!(matches!(replay, Err(IdentityError::Token(TokenError::NotFound))));

        let listed = identity.list_active(&store).await?;
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_active);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_confirmation_is_not_found() -> Result<()> {
        let store = MemoryStore::new();
        let notifier = Arc::new(CapturingNotifier::default());
        let identity = identity(notifier.clone())?;
        identity.register(&store, form("jane@x.com")).await?;
        let token = notifier.last_token().ok_or_else(|| anyhow!("no link mailed"))?;

        let racing = RacingStore::over(store.clone(), Rival::Consume(token.clone()));
        let result = identity.confirm(&racing, &token, "jane@x.com").await;
        assert!(matches!(result, Err(IdentityError::Token(TokenError::NotFound))));

        // The losing transaction was not applied.
        assert!(identity.list_active(&store).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn confirmation_without_user_keeps_token() -> Result<()> {
        let store = MemoryStore::new();
        let identity = identity(Arc::new(CapturingNotifier::default()))?;
        let token = OneTimeTokens::default()
            .issue(&store, "ghost@x.com", TokenPurpose::SignupConfirmation)
            .await?;

        let result = identity.confirm(&store, &token.token, "ghost@x.com").await;
        assert!(matches!(result, Err(IdentityError::NoSuchUser)));

        let mut tx = store.begin().await?;
        assert!(
            tx.token_exists(crate::store::TokenFilter::Value(&token.token))
                .await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn resend_supersedes_earlier_link() -> Result<()> {
        let store = MemoryStore::new();
        let notifier = Arc::new(CapturingNotifier::default());
        let identity = identity(notifier.clone())?;
        identity.register(&store, form("jane@x.com")).await?;
        let first = notifier.last_token().ok_or_else(|| anyhow!("no link mailed"))?;

        let delivery = identity.resend_confirmation(&store, "jane@x.com").await?;
        assert_eq!(delivery, Some(Delivery::Sent));
        let second = notifier.last_token().ok_or_else(|| anyhow!("no link mailed"))?;
        assert_ne!(first, second);

        let stale = identity.confirm(&store, &first, "jane@x.com").await;
        assert!(matches!(stale, Err(IdentityError::Token(TokenError::NotFound))));
        identity.confirm(&store, &second, "jane@x.com").await?;

        // Active and unknown addresses are ignored.
        assert_eq!(identity.resend_confirmation(&store, "jane@x.com").await?, None);
        assert_eq!(identity.resend_confirmation(&store, "nobody@x.com").await?, None);
        assert_eq!(notifier.count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_delivery_still_creates_user() -> Result<()> {
        let store = MemoryStore::new();
        let identity = identity(Arc::new(CapturingNotifier::failing()))?;
        let registered = identity.register(&store, form("jane@x.com")).await?;
        assert_eq!(registered.delivery, Delivery::Failed);

        let mut tx = store.begin().await?;
        assert!(tx.user_exists(UserFilter::Email("jane@x.com")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn token_outage_after_insert_degrades() -> Result<()> {
        let outage = TokenOutage::default();
        let notifier = Arc::new(CapturingNotifier::default());
        let identity = identity(notifier.clone())?;

        let registered = identity.register(&outage, form("jane@x.com")).await?;
        assert_eq!(registered.delivery, Delivery::Failed);
        assert_eq!(notifier.count(), 0);

        let retry = identity.register(&outage.inner, form("jane@x.com")).await;
        assert!(matches!(retry, Err(IdentityError::Conflict)));
        let resent = identity.resend_confirmation(&outage.inner, "jane@x.com").await?;
        assert_eq!(resent, Some(Delivery::Sent));
        Ok(())
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() -> Result<()> {
        let store = MemoryStore::new();
        let notifier = Arc::new(CapturingNotifier::default());
        let identity = identity(notifier.clone())?;
        identity.register(&store, form("inactive@x.com")).await?;
        registered_and_confirmed(&identity, &notifier, &store, "jane@x.com").await?;

        let attempts = [
            identity.login(&store, "@nobody", "Abcdefgh1").await,
            identity.login(&store, "@jane", "Wrongpass1").await,
            identity.login(&store, "@inactive", "Abcdefgh1").await,
        ];
        let messages: Vec<String> = attempts
            .iter()
            .map(|attempt| match attempt {
                Err(err @ IdentityError::NotAuthenticated) => err.to_string(),
                other => format!("unexpected: {other:?}"),
            })
            .collect();
        assert!(messages.iter().all(|m| m == "Incorrect username or password"));

        let grant = identity.login(&store, "@jane", "Abcdefgh1").await?;
        assert_eq!(grant.claims.sub, "@jane");
        Ok(())
    }

    #[tokio::test]
    async fn logout_revokes_unexpired_token() -> Result<()> {
        let store = MemoryStore::new();
        let notifier = Arc::new(CapturingNotifier::default());
        let identity = identity(notifier.clone())?;
        registered_and_confirmed(&identity, &notifier, &store, "jane@x.com").await?;
        let grant = identity.login(&store, "@jane", "Abcdefgh1").await?;

        let principal = authorize(&store, identity.sessions(), &grant.access_token).await?;
        assert_eq!(
            identity.logout(&store, &principal).await?,
            RevokeOutcome::Revoked
        );
        assert_eq!(
            identity.logout(&store, &principal).await?,
            RevokeOutcome::AlreadyRevoked
        );

        let reuse = authorize(&store, identity.sessions(), &grant.access_token).await;
        assert!(matches!(reuse, Err(GuardError::Unauthorized)));
        Ok(())
    }
}
