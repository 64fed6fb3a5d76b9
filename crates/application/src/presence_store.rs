use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// 在线状态存储错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PresenceStoreError {
    #[error("presence store unavailable: {message}")]
    Unavailable { message: String },
    #[error("invalid presence data under `{key}`: {message}")]
    InvalidData { key: String, message: String },
}

impl PresenceStoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// 带过期时间的键值存储（生产环境为 Redis）。
///
/// 每个 key 的操作独立且原子，不提供跨 key 事务。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PresenceStoreError>;

    /// 批量读取，必须是一次往返；返回值与 `keys` 一一对应。
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, PresenceStoreError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), PresenceStoreError>;

    async fn delete(&self, key: &str) -> Result<(), PresenceStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, PresenceStoreError>;

    /// 按 glob 模式（仅支持 `*`）列出存活的 key
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, PresenceStoreError>;
}

/// 只支持 `*` 通配的 glob 匹配，与 Redis `SCAN MATCH` 的常用子集一致。
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    if !key.starts_with(first) {
        return false;
    }
    let mut rest = &key[first.len()..];
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// 内存实现的在线状态存储（用于测试和单机开发）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    struct Entry {
        value: String,
        expires_at: Instant,
    }

    impl Entry {
        fn is_live(&self, now: Instant) -> bool {
            self.expires_at > now
        }
    }

    /// 过期时间基于 `tokio::time`，测试里可以用 `pause` / `advance` 驱动。
    #[derive(Default)]
    pub struct MemoryPresenceStore {
        entries: RwLock<HashMap<String, Entry>>,
        unavailable: AtomicBool,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// 模拟存储不可用
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), PresenceStoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(PresenceStoreError::unavailable("memory store marked unavailable"));
            }
            Ok(())
        }

        /// 清掉已经过期的条目，返回清理数量
        pub async fn purge_expired(&self) -> usize {
            let now = Instant::now();
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            before - entries.len()
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn get(&self, key: &str) -> Result<Option<String>, PresenceStoreError> {
            self.check()?;
            let now = Instant::now();
            let entries = self.entries.read().await;
            Ok(entries
                .get(key)
                .filter(|entry| entry.is_live(now))
                .map(|entry| entry.value.clone()))
        }

        async fn get_many(
            &self,
            keys: &[String],
        ) -> Result<Vec<Option<String>>, PresenceStoreError> {
            self.check()?;
            let now = Instant::now();
            let entries = self.entries.read().await;
            Ok(keys
                .iter()
                .map(|key| {
                    entries
                        .get(key)
                        .filter(|entry| entry.is_live(now))
                        .map(|entry| entry.value.clone())
                })
                .collect())
        }

        async fn set_with_ttl(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), PresenceStoreError> {
            self.check()?;
            let mut entries = self.entries.write().await;
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), PresenceStoreError> {
            self.check()?;
            self.entries.write().await.remove(key);
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool, PresenceStoreError> {
            self.check()?;
            let now = Instant::now();
            let entries = self.entries.read().await;
            Ok(entries.get(key).is_some_and(|entry| entry.is_live(now)))
        }

        async fn scan(&self, pattern: &str) -> Result<Vec<String>, PresenceStoreError> {
            self.check()?;
            let now = Instant::now();
            let entries = self.entries.read().await;
            let mut keys: Vec<String> = entries
                .iter()
                .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort();
            Ok(keys)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryPresenceStore;
    use super::*;

    #[test]
    fn glob_matches_star_segments() {
        assert!(glob_match("chat:typing:c1:*", "chat:typing:c1:u1"));
        assert!(!glob_match("chat:typing:c1:*", "chat:typing:c2:u1"));
        assert!(glob_match("*:u1", "chat:typing:c1:u1"));
        assert!(glob_match("a*b*c", "a--b--c"));
        assert!(!glob_match("a*b*c", "a--c"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryPresenceStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn get_many_preserves_key_order() {
        let store = MemoryPresenceStore::new();
        let ttl = Duration::from_secs(30);
        store.set_with_ttl("a", "1", ttl).await.unwrap();
        store.set_with_ttl("c", "3", ttl).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = store.get_many(&keys).await.unwrap();
        assert_eq!(values, vec![Some("1".into()), None, Some("3".into())]);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemoryPresenceStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(PresenceStoreError::Unavailable { .. })
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.is_ok());
    }
}
