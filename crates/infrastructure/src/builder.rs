use std::sync::Arc;

use application::presence_store::PresenceStore;
use application::repository::{MessageStatusStore, ParticipantDirectory};
use application::{RealtimeDependencies, SystemClock};
use config::AppConfig;
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    presence_store::RedisPresenceStore,
    repository::{create_pg_pool, PgMessageStatusStore, PgParticipantDirectory},
};

#[derive(Debug, Clone)]
pub struct InfrastructureConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub redis_url: String,
}

impl InfrastructureConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            database_url: config.database.url.clone(),
            max_connections: config.database.max_connections,
            redis_url: config.redis.url.clone(),
        }
    }
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 生产环境的外部协作方：Postgres（成员、消息状态）与 Redis（在线状态）
#[derive(Clone)]
pub struct Infrastructure {
    pub participants: Arc<PgParticipantDirectory>,
    pub message_status: Arc<PgMessageStatusStore>,
    pub presence_store: Arc<RedisPresenceStore>,
}

impl Infrastructure {
    pub async fn connect(config: InfrastructureConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database_url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!("数据库迁移完成");

        let presence_store = RedisPresenceStore::connect(&config.redis_url).await?;
        tracing::info!("Redis 连接已建立");

        Ok(Self {
            participants: Arc::new(PgParticipantDirectory::new(pool.clone())),
            message_status: Arc::new(PgMessageStatusStore::new(pool)),
            presence_store: Arc::new(presence_store),
        })
    }

    /// 组装实时层依赖
    pub fn realtime_dependencies(&self) -> RealtimeDependencies {
        let presence_store: Arc<dyn PresenceStore> = self.presence_store.clone();
        let participants: Arc<dyn ParticipantDirectory> = self.participants.clone();
        let message_status: Arc<dyn MessageStatusStore> = self.message_status.clone();
        RealtimeDependencies {
            presence_store,
            participants,
            message_status,
            clock: Arc::new(SystemClock),
        }
    }
}
