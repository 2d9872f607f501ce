/// Entity, monitoring log and incident store
///
/// The `Database` trait is the contract the engine talks to; `DatabaseImpl`
/// backs it with a pooled local libsql database.

pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::{Database, DatabaseImpl, StoreError, StoreResult};

use anyhow::Result;

use crate::config::DatabaseConfig;
use crate::pool;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}

/// Open the configured database, run migrations and return the store
pub async fn open(config: &DatabaseConfig) -> Result<DatabaseImpl> {
    let pool = pool::open_pool(&config.path, config.max_connections).await?;

    {
        let conn = pool.get().await.map_err(|e| anyhow::anyhow!("Failed to get database connection: {}", e))?;
        initialize_database(&conn).await?;
    }

    tracing::info!(path = %config.path, "Database ready");
    Ok(DatabaseImpl::new_from_pool(pool, config.query_timeout()))
}
