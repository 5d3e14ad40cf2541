//! `PostgreSQL` backend.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    postgres::{PgArguments, PgPool, PgRow},
    query::Query,
    Connection, PgConnection, Postgres, Row,
};
use tracing::{info_span, Instrument, Span};

use super::{
    Constraint, OneTimeToken, RevokedSessionToken, Role, Store, StoreError, TokenFilter,
    Transaction, User, UserFilter,
};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const USER_COLUMNS: &str = "id, username, email, name, surname, hashed_password, is_active, roles";
const TOKEN_COLUMNS: &str = "token, purpose, owner_email, expired, \
     EXTRACT(EPOCH FROM created_at)::BIGINT AS created_at_unix";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self.pool.acquire().instrument(acquire_span).await?;
        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping().instrument(ping_span).await?;
        Ok(())
    }
}

/// Apply `sql/schema.sql`; every statement is idempotent.
///
/// # Errors
/// Returns an error if the connection fails or a statement is rejected.
pub async fn apply_schema(dsn: &str) -> Result<()> {
    let mut connection = PgConnection::connect(dsn)
        .await
        .context("failed to connect for schema setup")?;

    for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
        sqlx::query(statement)
            .execute(&mut connection)
            .await
            .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
    }

    Ok(())
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

/// Translate SQLSTATE 23505 into a named [`Constraint`] violation and
/// 40001 into a write conflict.
pub(crate) fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => {
                let constraint = Constraint::from_name(db_err.constraint().unwrap_or_default());
                return StoreError::UniqueViolation(constraint);
            }
            Some("40001") => return StoreError::Conflict("serialization failure"),
            _ => {}
        }
    }
    StoreError::Database(err)
}

fn db_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn user_column(filter: UserFilter<'_>) -> &'static str {
    match filter {
        UserFilter::Id(_) => "id",
        UserFilter::Username(_) => "username",
        UserFilter::Email(_) => "email",
    }
}

fn bind_user<'q>(
    query: Query<'q, Postgres, PgArguments>,
    filter: UserFilter<'q>,
) -> Query<'q, Postgres, PgArguments> {
    match filter {
        UserFilter::Id(id) => query.bind(id),
        UserFilter::Username(value) | UserFilter::Email(value) => query.bind(value),
    }
}

fn token_predicate(filter: TokenFilter<'_>) -> &'static str {
    match filter {
        TokenFilter::Owner { .. } => "owner_email = $1 AND purpose = $2",
        TokenFilter::Value(_) => "token = $1",
        TokenFilter::OwnerAndValue { .. } => "owner_email = $1 AND token = $2",
    }
}

fn bind_token<'q>(
    query: Query<'q, Postgres, PgArguments>,
    filter: TokenFilter<'q>,
) -> Query<'q, Postgres, PgArguments> {
    match filter {
        TokenFilter::Owner { email, purpose } => query.bind(email).bind(purpose.as_str()),
        TokenFilter::Value(token) => query.bind(token),
        TokenFilter::OwnerAndValue { email, token } => query.bind(email).bind(token),
    }
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let roles: Vec<String> = row.try_get("roles")?;
    let roles = roles
        .iter()
        .map(|role| role.parse::<Role>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        surname: row.try_get("surname")?,
        hashed_password: row.try_get("hashed_password")?,
        is_active: row.try_get("is_active")?,
        roles,
    })
}

fn token_from_row(row: &PgRow) -> Result<OneTimeToken, StoreError> {
    let purpose: String = row.try_get("purpose")?;
    Ok(OneTimeToken {
        token: row.try_get("token")?,
        purpose: purpose.parse()?,
        owner_email: row.try_get("owner_email")?,
        created_at_unix: row.try_get("created_at_unix")?,
        expired: row.try_get("expired")?,
    })
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn user_exists(&mut self, filter: UserFilter<'_>) -> Result<bool, StoreError> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM users WHERE {} = $1) AS exists",
            user_column(filter)
        );
        let row = bind_user(sqlx::query(&query), filter)
            .fetch_one(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_sqlx)?;
        Ok(row.try_get("exists")?)
    }

    async fn find_user(&mut self, filter: UserFilter<'_>) -> Result<Option<User>, StoreError> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE {} = $1 LIMIT 1",
            user_column(filter)
        );
        let row = bind_user(sqlx::query(&query), filter)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO users
                (id, username, email, name, surname, hashed_password, is_active, roles)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        let roles: Vec<&str> = user.roles.iter().map(|role| role.as_str()).collect();
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.name)
            .bind(&user.surname)
            .bind(&user.hashed_password)
            .bind(user.is_active)
            .bind(roles)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn activate_user(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        let query = format!("UPDATE users SET is_active = TRUE WHERE email = $1 RETURNING {USER_COLUMNS}");
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("UPDATE", &query))
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_active_users(&mut self) -> Result<Vec<User>, StoreError> {
        let query =
            format!("SELECT {USER_COLUMNS} FROM users WHERE is_active = TRUE ORDER BY created_at");
        let rows = sqlx::query(&query)
            .fetch_all(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(user_from_row).collect()
    }

    async fn token_exists(&mut self, filter: TokenFilter<'_>) -> Result<bool, StoreError> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM one_time_tokens WHERE {}) AS exists",
            token_predicate(filter)
        );
        let row = bind_token(sqlx::query(&query), filter)
            .fetch_one(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_sqlx)?;
        Ok(row.try_get("exists")?)
    }

    async fn find_token(
        &mut self,
        filter: TokenFilter<'_>,
    ) -> Result<Option<OneTimeToken>, StoreError> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM one_time_tokens WHERE {} LIMIT 1",
            token_predicate(filter)
        );
        let row = bind_token(sqlx::query(&query), filter)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn insert_token(&mut self, token: &OneTimeToken) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO one_time_tokens
                (token, purpose, owner_email, expired, created_at)
            VALUES ($1, $2, $3, $4, TO_TIMESTAMP($5::BIGINT))
        ";
        sqlx::query(query)
            .bind(&token.token)
            .bind(token.purpose.as_str())
            .bind(&token.owner_email)
            .bind(token.expired)
            .bind(token.created_at_unix)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_tokens(&mut self, filter: TokenFilter<'_>) -> Result<u64, StoreError> {
        let query = format!(
            "DELETE FROM one_time_tokens WHERE {}",
            token_predicate(filter)
        );
        let result = bind_token(sqlx::query(&query), filter)
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", &query))
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn insert_revoked(&mut self, entry: &RevokedSessionToken) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO revoked_session_tokens (token, email, expires_at)
            VALUES ($1, $2, TO_TIMESTAMP($3::BIGINT))
        ";
        sqlx::query(query)
            .bind(&entry.token)
            .bind(&entry.email)
            .bind(entry.expires_at_unix)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn is_revoked(&mut self, token: &str) -> Result<bool, StoreError> {
        let query =
            "SELECT EXISTS(SELECT 1 FROM revoked_session_tokens WHERE token = $1) AS exists";
        let row = sqlx::query(query)
            .bind(token)
            .fetch_one(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(map_sqlx)?;
        Ok(row.try_get("exists")?)
    }

    async fn prune_revoked(&mut self, now_unix: i64) -> Result<u64, StoreError> {
        let query = "DELETE FROM revoked_session_tokens WHERE expires_at <= TO_TIMESTAMP($1::BIGINT)";
        let result = sqlx::query(query)
            .bind(now_unix)
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}
