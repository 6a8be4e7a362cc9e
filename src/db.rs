use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;

/// Build a lazily-connecting Postgres pool from config, or `None` when no
/// database URL is configured (the server still boots for health checks).
pub fn build_pool(config: &AppConfig) -> Option<PgPool> {
    let url = config.supabase_db_url.as_deref()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections.max(1))
        .min_connections(config.db_pool_min_connections)
        .acquire_timeout(Duration::from_secs(
            config.db_pool_acquire_timeout_seconds.max(1),
        ))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
        .connect_lazy(url);

    match pool {
        Ok(pool) => Some(pool),
        Err(error) => {
            tracing::error!(%error, "Invalid database URL, continuing without a pool");
            None
        }
    }
}
