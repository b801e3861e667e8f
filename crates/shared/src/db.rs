//! Database utilities and connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Sizing and timeouts for one Postgres pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl PoolSettings {
    /// Pool for license operations. Each lifecycle call holds one connection
    /// for a short transaction, so a handful is enough.
    pub fn service(max_connections: u32) -> Self {
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
        }
    }

    /// Single connection with a long acquire timeout; migrations run sequentially
    pub fn migrations() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(180),
        }
    }
}

/// Connect a pool with the given settings
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn connect(database_url: &str, settings: PoolSettings) -> Result<PgPool, sqlx::Error> {
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(0)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .max_lifetime(settings.max_lifetime)
        .connect_with(options)
        .await
}

/// Create the service connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    connect(database_url, PoolSettings::service(max_connections)).await
}

/// Run database migrations on an existing pool
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// Apply migrations over a dedicated single-connection pool, then close it
pub async fn migrate(database_url: &str) -> Result<(), sqlx::migrate::MigrateError> {
    let pool = connect(database_url, PoolSettings::migrations()).await?;
    let result = run_migrations(&pool).await;
    pool.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_pool_has_at_least_one_connection() {
        assert_eq!(PoolSettings::service(0).max_connections, 1);
        assert_eq!(PoolSettings::service(8).max_connections, 8);
        assert_eq!(PoolSettings::migrations().max_connections, 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_migrate_then_create_pool() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        migrate(&url).await.expect("Failed to run migrations");
        let pool = create_pool(&url, 2).await.expect("Failed to create pool");
        let one: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("Query failed");
        assert_eq!(one, 1);
    }
}
