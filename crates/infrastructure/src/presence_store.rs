use std::time::Duration;

use application::presence_store::{PresenceStore, PresenceStoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;

/// SCAN 每批建议返回的数量
const SCAN_BATCH: usize = 200;

fn map_redis_err(err: redis::RedisError) -> PresenceStoreError {
    PresenceStoreError::unavailable(format!("Redis operation failed: {err}"))
}

/// Redis实现的在线状态存储
///
/// `ConnectionManager` 自带断线重连，克隆开销很小，每次操作克隆一份即可。
#[derive(Clone)]
pub struct RedisPresenceStore {
    manager: ConnectionManager,
}

impl RedisPresenceStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager))
    }

    pub async fn ping(&self) -> Result<(), PresenceStoreError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PresenceStoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, PresenceStoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.manager.clone();
        // 使用Redis管道批量读取，一次往返
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        pipe.query_async(&mut conn).await.map_err(map_redis_err)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), PresenceStoreError> {
        let mut conn = self.manager.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PresenceStoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, PresenceStoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, PresenceStoreError> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN 可能重复返回同一个 key
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
