//! Shared application state threaded through every HTTP handler (spec §4.10).

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::audit::{AuditStore, PgAuditStore};
use crate::config::GatewayConfig;
use crate::kv::{KeyValueStore, RedisStore};
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::policy::{HttpPolicyClient, PolicyEngineClient};
use crate::rate_limit::RateLimiter;
use crate::replay::AntiReplayGate;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub db_pool: PgPool,
    pub kv: Arc<dyn KeyValueStore>,
    pub policy: Arc<dyn PolicyEngineClient>,
    pub metrics: Arc<Metrics>,
    pub orchestrator: Arc<Orchestrator>,
    pub healthcheck_timeout: Duration,
}

impl AppState {
    pub async fn build(config: GatewayConfig) -> anyhow::Result<Self> {
        let db_pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db_pool).await?;

        let kv: Arc<dyn KeyValueStore> =
            Arc::new(RedisStore::connect(&config.redis_url, config.redis_timeout).await?);
        let policy: Arc<dyn PolicyEngineClient> = Arc::new(HttpPolicyClient::new(
            config.policy_base_url.clone(),
            config.policy_timeout,
        ));
        let audit: Arc<dyn AuditStore> =
            Arc::new(PgAuditStore::new(db_pool.clone(), config.audit_timeout));
        let metrics = Arc::new(Metrics::new());

        let replay = AntiReplayGate::new(
            kv.clone(),
            config.anti_replay_enabled,
            config.anti_replay_ttl_seconds,
        );
        let rate_limiter = RateLimiter::new(kv.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            replay,
            rate_limiter,
            audit,
            policy.clone(),
            metrics.clone(),
        ));

        let healthcheck_timeout = config.healthcheck_timeout;
        Ok(Self {
            config: Arc::new(config),
            db_pool,
            kv,
            policy,
            metrics,
            orchestrator,
            healthcheck_timeout,
        })
    }
}
