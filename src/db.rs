//! Postgres-backed account and attribute storage

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    FromRow, PgPool,
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Settings;
use crate::services::accounts::{Account, AccountId, AccountStore, CreateAccountError, NewAccount};
use crate::services::token_store::AttributeStore;

/// Create a PostgreSQL connection pool and apply pending migrations
pub async fn create_pool(settings: &Settings) -> Result<PgPool> {
    let connect_options = PgConnectOptions::from_str(&settings.database_url)
        .context("Invalid DATABASE_URL")?
        .application_name("klarna-signin");

    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect_with(connect_options)
        .await
        .context("Failed to connect to PostgreSQL")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    tracing::info!(
        max_connections = settings.database_max_connections,
        "Database connection pool established"
    );

    Ok(pool)
}

/// Lightweight health check for database connectivity
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").fetch_one(pool).await.is_ok()
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: i64,
    login: String,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    display_name: String,
    locale: Option<String>,
    role: String,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            login: row.login,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            display_name: row.display_name,
            locale: row.locale,
            role: row.role,
        }
    }
}

const ACCOUNT_COLUMNS: &str =
    "id, login, email, first_name, last_name, display_name, locale, role";

#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_login(&self, login: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE login = $1"
        ))
        .bind(login)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up account by login")?;

        Ok(row.map(Account::from))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up account by email")?;

        Ok(row.map(Account::from))
    }

    async fn create(&self, account: NewAccount) -> Result<AccountId, CreateAccountError> {
        let result = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO accounts
                (login, email, password, first_name, last_name, display_name, locale, role, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&account.login)
        .bind(&account.email)
        .bind(&account.password)
        .bind(&account.first_name)
        .bind(&account.last_name)
        .bind(&account.display_name)
        .bind(&account.locale)
        .bind(&account.role)
        .bind(&account.description)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CreateAccountError::Conflict(account.login))
            }
            Err(e) => Err(CreateAccountError::Other(
                anyhow::Error::new(e).context("Failed to insert account"),
            )),
        }
    }
}

#[derive(Clone)]
pub struct PgAttributeStore {
    pool: PgPool,
}

impl PgAttributeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttributeStore for PgAttributeStore {
    async fn get_attribute(&self, account: AccountId, key: &str) -> Result<Option<Value>> {
        sqlx::query_scalar::<_, Value>(
            "SELECT value FROM account_attributes WHERE account_id = $1 AND key = $2",
        )
        .bind(account)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read account attribute")
    }

    async fn set_attribute(&self, account: AccountId, key: &str, value: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_attributes (account_id, key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (account_id, key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = NOW()
            "#,
        )
        .bind(account)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to write account attribute")?;
        Ok(())
    }

    async fn delete_attribute(&self, account: AccountId, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM account_attributes WHERE account_id = $1 AND key = $2")
            .bind(account)
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to delete account attribute")?;
        Ok(())
    }
}
