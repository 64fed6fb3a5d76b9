use async_trait::async_trait;
use domain::{
    ConversationId, MessageId, MessageStatus, RepositoryResult, StatusTransition, UserId,
};

/// 会话成员目录，由聊天核心维护，这里只读。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    /// 会话当前的成员；会话不存在返回 `NotFound`。
    async fn participants(&self, conversation_id: ConversationId)
        -> RepositoryResult<Vec<UserId>>;
}

/// 按接收方记录的消息状态存储。
///
/// 实现必须保证同一 `(message, user)` 上的推进是原子的：
/// 状态只向前走，重复或回退的上报返回 `Unchanged`。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStatusStore: Send + Sync {
    async fn update_status(
        &self,
        message_id: MessageId,
        user_id: UserId,
        status: MessageStatus,
    ) -> RepositoryResult<StatusTransition>;
}

/// 内存实现（用于测试和本地开发）
pub mod memory {
    use super::*;
    use domain::{DomainError, RepositoryError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryParticipantDirectory {
        conversations: RwLock<HashMap<ConversationId, Vec<UserId>>>,
    }

    impl MemoryParticipantDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_participants(
            &self,
            conversation_id: ConversationId,
            participants: Vec<UserId>,
        ) {
            self.conversations
                .write()
                .await
                .insert(conversation_id, participants);
        }
    }

    #[async_trait]
    impl ParticipantDirectory for MemoryParticipantDirectory {
        async fn participants(
            &self,
            conversation_id: ConversationId,
        ) -> RepositoryResult<Vec<UserId>> {
            self.conversations
                .read()
                .await
                .get(&conversation_id)
                .cloned()
                .ok_or(RepositoryError::NotFound)
        }
    }

    /// 未登记过的 `(message, user)` 从 `sent` 开始。
    #[derive(Default)]
    pub struct MemoryMessageStatusStore {
        statuses: RwLock<HashMap<(MessageId, UserId), MessageStatus>>,
        applied: AtomicUsize,
        unavailable: AtomicBool,
    }

    impl MemoryMessageStatusStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed(&self, message_id: MessageId, user_id: UserId, status: MessageStatus) {
            self.statuses
                .write()
                .await
                .insert((message_id, user_id), status);
        }

        pub async fn status_of(&self, message_id: MessageId, user_id: UserId) -> MessageStatus {
            self.statuses
                .read()
                .await
                .get(&(message_id, user_id))
                .copied()
                .unwrap_or(MessageStatus::Sent)
        }

        /// 实际生效的状态变更次数
        pub fn applied_transitions(&self) -> usize {
            self.applied.load(Ordering::SeqCst)
        }

        /// 模拟存储故障
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MessageStatusStore for MemoryMessageStatusStore {
        async fn update_status(
            &self,
            message_id: MessageId,
            user_id: UserId,
            status: MessageStatus,
        ) -> RepositoryResult<StatusTransition> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(RepositoryError::storage("memory status store unavailable"));
            }

            let mut statuses = self.statuses.write().await;
            let current = statuses
                .get(&(message_id, user_id))
                .copied()
                .unwrap_or(MessageStatus::Sent);

            let transition = current.advance(status).map_err(|err| match err {
                DomainError::IllegalTransition { .. } => RepositoryError::Conflict,
                other => RepositoryError::storage(other.to_string()),
            })?;

            if let StatusTransition::Applied { to, .. } = transition {
                statuses.insert((message_id, user_id), to);
                self.applied.fetch_add(1, Ordering::SeqCst);
            }
            Ok(transition)
        }
    }

}
