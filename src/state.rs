use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: reqwest::Client,
    /// Caches `organization_members` rows keyed by `"{org_id}:{user_id}"`.
    pub membership_cache: Cache<String, Option<Value>>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = db::build_pool(&config);
        if db_pool.is_none() {
            tracing::warn!(
                "No database configured — set SUPABASE_DB_URL or DATABASE_URL to enable billing"
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let membership_cache = Cache::builder()
            .time_to_live(Duration::from_secs(config.org_membership_cache_ttl_seconds.max(1)))
            .max_capacity(config.org_membership_cache_max_entries)
            .build();

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            membership_cache,
        })
    }
}
