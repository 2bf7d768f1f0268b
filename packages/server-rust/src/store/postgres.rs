//! `PostgreSQL` [`SecretStore`] built on `sqlx`.
//!
//! Each write runs in its own serializable transaction inserting one row
//! into `secret (hash)`. The write is spawned onto the runtime so
//! `keep_secret` never blocks; the completion fires when the transaction
//! commits, fails, or exceeds [`WRITE_TIMEOUT`].

use std::time::Duration;

use sqlx::PgPool;
use tracing::warn;

use super::{Completion, SecretStore, StoreError};

/// Upper bound for one insert transaction.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Store writing tokens to a `secret` table.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    /// Creates the `secret` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL statement fails.
    pub async fn initialize(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS secret (
                id BIGSERIAL PRIMARY KEY,
                hash TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert(pool: PgPool, token: Vec<u8>) -> Result<(), sqlx::Error> {
        let hash = String::from_utf8_lossy(&token).into_owned();
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO secret (hash) VALUES ($1)")
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }
}

impl SecretStore for PostgresStore {
    fn keep_secret(&self, token: Vec<u8>) -> Completion {
        let (done, completion) = Completion::channel();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let insert = Self::insert(pool, token);
            let outcome = match tokio::time::timeout(WRITE_TIMEOUT, insert).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!(error = %e, "secret insert failed");
                    Err(StoreError::Backend(e.to_string()))
                }
                Err(_elapsed) => Err(StoreError::TimedOut),
            };
            let _ = done.send(outcome);
        });

        completion
    }
}
