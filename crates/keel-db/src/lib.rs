//! PostgreSQL state backend for keel.
//!
//! Stores one row per stack holding the latest state document and the
//! run lock, so several operators can share state safely.

pub mod error;
pub mod state;

pub use error::{DbError, DbResult};
pub use state::PgStateStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
