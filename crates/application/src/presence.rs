//! 在线状态与输入状态服务
//!
//! 状态以带 TTL 的记录保存在 [`PresenceStore`] 中：连接存活期间周期性续约，
//! 客户端消失后记录自然过期，`mark_offline` 只是断开时的快速路径。
//!
//! Key 布局：
//! - `{prefix}:presence:{user_id}` → `PresenceRecord` JSON
//! - `{prefix}:typing:{conversation_id}:{user_id}` → 存在即正在输入

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{ConversationId, Event, PresenceRecord, PresenceStatus, Timestamp, UserId};

use crate::clock::Clock;
use crate::hub::Hub;
use crate::presence_store::{PresenceStore, PresenceStoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceKeys {
    prefix: String,
}

impl PresenceKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn presence(&self, user_id: UserId) -> String {
        format!("{}:presence:{}", self.prefix, user_id)
    }

    pub fn typing(&self, conversation_id: ConversationId, user_id: UserId) -> String {
        format!("{}:typing:{}:{}", self.prefix, conversation_id, user_id)
    }

    pub fn typing_pattern(&self, conversation_id: ConversationId) -> String {
        format!("{}:typing:{}:*", self.prefix, conversation_id)
    }

    fn typing_user(&self, conversation_id: ConversationId, key: &str) -> Option<UserId> {
        let prefix = format!("{}:typing:{}:", self.prefix, conversation_id);
        key.strip_prefix(&prefix)?.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub key_prefix: String,
    pub presence_ttl: Duration,
    pub typing_ttl: Duration,
    pub offline_retention: Duration,
}

pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    hub: Arc<Hub>,
    clock: Arc<dyn Clock>,
    keys: PresenceKeys,
    presence_ttl: Duration,
    typing_ttl: Duration,
    offline_retention: Duration,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        hub: Arc<Hub>,
        clock: Arc<dyn Clock>,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            store,
            hub,
            clock,
            keys: PresenceKeys::new(settings.key_prefix),
            presence_ttl: settings.presence_ttl,
            typing_ttl: settings.typing_ttl,
            offline_retention: settings.offline_retention,
        }
    }

    pub fn presence_ttl(&self) -> Duration {
        self.presence_ttl
    }

    pub fn keys(&self) -> &PresenceKeys {
        &self.keys
    }

    /// 标记在线并续约。写失败只记录日志。
    pub async fn heartbeat(&self, user_id: UserId, ttl: Duration) {
        self.write_record(user_id, PresenceStatus::Online, ttl).await;
    }

    /// 标记离开；同样依赖后续心跳续约
    pub async fn set_away(&self, user_id: UserId, ttl: Duration) {
        self.write_record(user_id, PresenceStatus::Away, ttl).await;
    }

    /// 最后一条连接断开时调用，保留 lastSeenAt 一段时间
    pub async fn mark_offline(&self, user_id: UserId) {
        self.write_record(user_id, PresenceStatus::Offline, self.offline_retention)
            .await;
    }

    async fn write_record(&self, user_id: UserId, status: PresenceStatus, ttl: Duration) {
        let record = PresenceRecord::new(status, self.clock.now());
        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "在线记录序列化失败");
                return;
            }
        };
        if let Err(err) = self
            .store
            .set_with_ttl(&self.keys.presence(user_id), &value, ttl)
            .await
        {
            tracing::warn!(
                user_id = %user_id,
                status = %status,
                error = %err,
                "在线状态写入失败，已丢弃"
            );
        }
    }

    /// 设置输入标记并通知会话内其他成员
    pub async fn set_typing(&self, conversation_id: ConversationId, user_id: UserId) {
        if let Err(err) = self
            .store
            .set_with_ttl(&self.keys.typing(conversation_id, user_id), "1", self.typing_ttl)
            .await
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                user_id = %user_id,
                error = %err,
                "输入标记写入失败"
            );
        }
        self.handle_typing(conversation_id, user_id, true).await;
    }

    pub async fn clear_typing(&self, conversation_id: ConversationId, user_id: UserId) {
        if let Err(err) = self
            .store
            .delete(&self.keys.typing(conversation_id, user_id))
            .await
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                user_id = %user_id,
                error = %err,
                "输入标记删除失败"
            );
        }
        self.handle_typing(conversation_id, user_id, false).await;
    }

    /// 把输入状态变化广播给会话中除输入者以外的成员
    pub async fn handle_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    ) {
        let event = Event::typing(conversation_id, user_id, is_typing);
        if let Err(err) = self
            .hub
            .broadcast_to_conversation_except(conversation_id, user_id, event)
            .await
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                user_id = %user_id,
                error = %err,
                "输入状态广播失败"
            );
        }
    }

    /// 读取原始在线记录；过期即 `None`
    pub async fn record(
        &self,
        user_id: UserId,
    ) -> Result<Option<PresenceRecord>, PresenceStoreError> {
        let key = self.keys.presence(user_id);
        match self.store.get(&key).await? {
            Some(value) => parse_record(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// 存储不可用时返回 false
    pub async fn is_online(&self, user_id: UserId) -> bool {
        match self.record(user_id).await {
            Ok(record) => record.is_some_and(|record| record.is_online()),
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "在线状态查询失败，按离线处理");
                false
            }
        }
    }

    pub async fn status(&self, user_id: UserId) -> PresenceStatus {
        match self.record(user_id).await {
            Ok(Some(record)) => record.status,
            Ok(None) => PresenceStatus::Offline,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "在线状态查询失败，按离线处理");
                PresenceStatus::Offline
            }
        }
    }

    pub async fn last_seen(
        &self,
        user_id: UserId,
    ) -> Result<Option<Timestamp>, PresenceStoreError> {
        Ok(self.record(user_id).await?.map(|record| record.last_seen_at))
    }

    /// 一次批量读取得到多个用户的状态；失败时全部视为离线
    pub async fn get_bulk_status(&self, user_ids: &[UserId]) -> HashMap<UserId, PresenceStatus> {
        let keys: Vec<String> = user_ids.iter().map(|id| self.keys.presence(*id)).collect();
        let values = match self.store.get_many(&keys).await {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(count = user_ids.len(), error = %err, "批量在线状态查询失败");
                vec![None; user_ids.len()]
            }
        };

        user_ids
            .iter()
            .zip(keys.iter().zip(values))
            .map(|(user_id, (key, value))| {
                let status = value
                    .and_then(|value| match parse_record(key, &value) {
                        Ok(record) => Some(record.status),
                        Err(err) => {
                            tracing::warn!(error = %err, "忽略无法解析的在线记录");
                            None
                        }
                    })
                    .unwrap_or(PresenceStatus::Offline);
                (*user_id, status)
            })
            .collect()
    }

    pub async fn is_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.store
            .exists(&self.keys.typing(conversation_id, user_id))
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "输入标记查询失败");
                false
            })
    }

    /// 会话中正在输入的用户
    pub async fn typing_users(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, PresenceStoreError> {
        let keys = self
            .store
            .scan(&self.keys.typing_pattern(conversation_id))
            .await?;
        let mut users: Vec<UserId> = keys
            .iter()
            .filter_map(|key| self.keys.typing_user(conversation_id, key))
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}

fn parse_record(key: &str, value: &str) -> Result<PresenceRecord, PresenceStoreError> {
    serde_json::from_str(value).map_err(|err| PresenceStoreError::InvalidData {
        key: key.to_string(),
        message: err.to_string(),
    })
}
