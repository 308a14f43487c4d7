use async_trait::async_trait;
use sqlx::{sqlite::SqliteConnectOptions, Executor as _, SqlitePool};
use std::path::Path;

use crate::{password::PasswordAuthenticator, AuthError};

/// Local credential store backing the `local` provider.
#[async_trait]
pub trait UserDatabase: Clone + Send + Sync + 'static {
    async fn build(path: &Path) -> Result<Self, sqlx::Error>;
    /// Usernames are unique. The password is hashed before it is stored.
    async fn create_user(&self, username: &str, unhashed_password: &str) -> Result<(), sqlx::Error>;
    async fn set_password(&self, username: &str, unhashed_password: &str) -> Result<(), sqlx::Error>;
    async fn delete_user(&self, username: &str) -> Result<(), sqlx::Error>;
    /// False both for an unknown user and a wrong password.
    async fn verify_password(&self, username: &str, unhashed_password: &str) -> Result<bool, sqlx::Error>;
}

async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            password TEXT NOT NULL
        )
        "#,
    )
    .await?;
    Ok(())
}

#[async_trait]
impl UserDatabase for SqlitePool {
    #[tracing::instrument(err)]
    async fn build(path: &Path) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        create_schema(&pool).await?;
        Ok(pool)
    }

    #[tracing::instrument(skip(self, unhashed_password), err)]
    async fn create_user(&self, username: &str, unhashed_password: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO users (username, password) VALUES (?1, ?2)")
            .bind(username)
            .bind(password_auth::generate_hash(unhashed_password))
            .execute(self)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, unhashed_password), err)]
    async fn set_password(&self, username: &str, unhashed_password: &str) -> Result<(), sqlx::Error> {
        let result = sqlx::query("UPDATE users SET password = ?1 WHERE username = ?2")
            .bind(password_auth::generate_hash(unhashed_password))
            .bind(username)
            .execute(self)
            .await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete_user(&self, username: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(self)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, unhashed_password), err)]
    async fn verify_password(&self, username: &str, unhashed_password: &str) -> Result<bool, sqlx::Error> {
        let stored = sqlx::query_as::<_, (String,)>("SELECT password FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self)
            .await?;
        Ok(stored.is_some_and(|(hash,)| {
            password_auth::verify_password(unhashed_password, &hash).is_ok()
        }))
    }
}

#[async_trait]
impl PasswordAuthenticator for SqlitePool {
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        self.verify_password(username, password).await.map_err(|err| {
            tracing::error!("{err:?}");
            AuthError::Internal(err.to_string())
        })
    }
}
