//! PostgreSQL access
//!
//! Stores hold clones of the pool; `Database` owns the original and answers
//! health probes.

pub mod schema;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 20;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;

        tracing::info!(max_connections = MAX_CONNECTIONS, "PostgreSQL pool ready");
        Ok(Self { pool })
    }

    /// Connect, then create any missing tables
    pub async fn connect_and_migrate(database_url: &str) -> Result<Self, sqlx::Error> {
        let db = Self::connect(database_url).await?;
        schema::init_schema(&db.pool).await?;
        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// One round trip through the pool
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_connect_migrate_is_repeatable() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let db = Database::connect_and_migrate(&url).await.unwrap();
        db.health_check().await.unwrap();
        schema::init_schema(db.pool()).await.unwrap();
    }
}
