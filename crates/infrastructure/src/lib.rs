//! 基础设施层实现。
//!
//! 提供 Redis 在线状态存储和 PostgreSQL 会话成员 / 消息状态适配器，实现应用层定义的接口。

pub mod builder;
pub mod migrations;
pub mod presence_store;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureConfig, InfrastructureError};
pub use migrations::MIGRATOR;
pub use presence_store::RedisPresenceStore;
pub use repository::{create_pg_pool, PgMessageStatusStore, PgParticipantDirectory};
