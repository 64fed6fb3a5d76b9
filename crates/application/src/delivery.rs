//! 送达 / 已读回执协调
//!
//! 先持久化再广播：持久化失败不发任何事件；重复上报不产生新的持久化变更，也不再广播。

use std::sync::Arc;

use domain::{
    ConversationId, Event, MessageId, MessageStatus, RepositoryError, StatusTransition, UserId,
};
use thiserror::Error;

use crate::clock::Clock;
use crate::hub::{BroadcastReport, Hub, HubError};
use crate::repository::MessageStatusStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("failed to persist `{status}` for message {message_id}: {source}")]
    Persistence {
        message_id: MessageId,
        status: MessageStatus,
        #[source]
        source: RepositoryError,
    },
    /// 状态已经落库，但回执没能广播出去
    #[error("receipt for message {message_id} persisted but not broadcast: {source}")]
    Broadcast {
        message_id: MessageId,
        #[source]
        source: HubError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 状态推进并已广播
    Applied {
        from: MessageStatus,
        to: MessageStatus,
        report: BroadcastReport,
    },
    /// 重复或过时的上报，没有变化
    Duplicate { current: MessageStatus },
}

pub struct DeliveryCoordinator {
    store: Arc<dyn MessageStatusStore>,
    hub: Arc<Hub>,
    clock: Arc<dyn Clock>,
}

impl DeliveryCoordinator {
    pub fn new(store: Arc<dyn MessageStatusStore>, hub: Arc<Hub>, clock: Arc<dyn Clock>) -> Self {
        Self { store, hub, clock }
    }

    pub async fn handle_delivered(
        &self,
        user_id: UserId,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        self.apply(user_id, message_id, conversation_id, MessageStatus::Delivered)
            .await
    }

    /// 没有送达记录也可以直接标记已读
    pub async fn handle_read(
        &self,
        user_id: UserId,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        self.apply(user_id, message_id, conversation_id, MessageStatus::Read)
            .await
    }

    async fn apply(
        &self,
        user_id: UserId,
        message_id: MessageId,
        conversation_id: ConversationId,
        status: MessageStatus,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let transition = self
            .store
            .update_status(message_id, user_id, status)
            .await
            .map_err(|source| {
                tracing::error!(
                    message_id = %message_id,
                    user_id = %user_id,
                    status = %status,
                    error = %source,
                    "消息状态持久化失败，不广播回执"
                );
                DeliveryError::Persistence {
                    message_id,
                    status,
                    source,
                }
            })?;

        let (from, to) = match transition {
            StatusTransition::Unchanged(current) => {
                tracing::debug!(
                    message_id = %message_id,
                    user_id = %user_id,
                    current = %current,
                    "重复回执，忽略"
                );
                return Ok(DeliveryOutcome::Duplicate { current });
            }
            StatusTransition::Applied { from, to } => (from, to),
        };

        let Some(event) = Event::receipt(message_id, conversation_id, user_id, to, self.clock.now())
        else {
            return Ok(DeliveryOutcome::Duplicate { current: to });
        };

        let report = self
            .hub
            .broadcast_to_conversation(conversation_id, event)
            .await
            .map_err(|source| {
                tracing::error!(
                    message_id = %message_id,
                    conversation_id = %conversation_id,
                    error = %source,
                    "回执已持久化但广播失败"
                );
                DeliveryError::Broadcast { message_id, source }
            })?;

        tracing::debug!(
            message_id = %message_id,
            user_id = %user_id,
            from = %from,
            to = %to,
            recipients = report.recipients,
            "回执已广播"
        );
        Ok(DeliveryOutcome::Applied { from, to, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::connection::{Connection, Outbound};
    use crate::repository::memory::{MemoryMessageStatusStore, MemoryParticipantDirectory};
    use crate::repository::MockMessageStatusStore;
    use chrono::Utc;
    use domain::{ConnectionId, DisplayName};
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryMessageStatusStore>,
        coordinator: DeliveryCoordinator,
        conversation: ConversationId,
        recipient: UserId,
        sender_rx: mpsc::Receiver<Outbound>,
        _hub: Arc<Hub>,
    }

    async fn fixture() -> Fixture {
        let conversation = ConversationId::random();
        let sender = UserId::random();
        let recipient = UserId::random();

        let directory = Arc::new(MemoryParticipantDirectory::new());
        directory
            .set_participants(conversation, vec![sender, recipient])
            .await;
        let hub = Arc::new(Hub::new(directory, 10));
        let (connection, sender_rx) = Connection::new(
            ConnectionId::random(),
            sender,
            DisplayName::parse("sender").unwrap(),
            16,
            Utc::now(),
        );
        hub.register(connection).await.unwrap();

        let store = Arc::new(MemoryMessageStatusStore::new());
        let coordinator =
            DeliveryCoordinator::new(store.clone(), hub.clone(), Arc::new(SystemClock));
        Fixture {
            store,
            coordinator,
            conversation,
            recipient,
            sender_rx,
            _hub: hub,
        }
    }

    fn receipts(rx: &mut mpsc::Receiver<Outbound>) -> Vec<(&'static str, UserId)> {
        let mut out = Vec::new();
        while let Ok(Outbound::Event(event)) = rx.try_recv() {
            match event.as_ref() {
                Event::MessageDelivered(p) | Event::MessageRead(p) => {
                    out.push((event.event_type(), p.user_id))
                }
                _ => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn repeated_delivered_is_persisted_and_broadcast_once() {
        let mut fx = fixture().await;
        let message = MessageId::random();

        let first = fx
            .coordinator
            .handle_delivered(fx.recipient, message, fx.conversation)
            .await
            .unwrap();
        assert!(matches!(first, DeliveryOutcome::Applied { .. }));

        let second = fx
            .coordinator
            .handle_delivered(fx.recipient, message, fx.conversation)
            .await
            .unwrap();
        assert_eq!(
            second,
            DeliveryOutcome::Duplicate {
                current: MessageStatus::Delivered
            }
        );

        assert_eq!(fx.store.applied_transitions(), 1);
        assert_eq!(
            receipts(&mut fx.sender_rx),
            vec![("message.delivered", fx.recipient)]
        );
    }

    #[tokio::test]
    async fn delivered_then_read_advances_to_read() {
        let mut fx = fixture().await;
        let message = MessageId::random();

        fx.coordinator
            .handle_delivered(fx.recipient, message, fx.conversation)
            .await
            .unwrap();
        let read = fx
            .coordinator
            .handle_read(fx.recipient, message, fx.conversation)
            .await
            .unwrap();

        assert!(matches!(
            read,
            DeliveryOutcome::Applied {
                from: MessageStatus::Delivered,
                to: MessageStatus::Read,
                ..
            }
        ));
        assert_eq!(fx.store.status_of(message, fx.recipient).await, MessageStatus::Read);
        assert_eq!(fx.store.applied_transitions(), 2);
        assert_eq!(
            receipts(&mut fx.sender_rx),
            vec![
                ("message.delivered", fx.recipient),
                ("message.read", fx.recipient)
            ]
        );
    }

    #[tokio::test]
    async fn read_without_delivered_lands_on_read() {
        let mut fx = fixture().await;
        let message = MessageId::random();

        fx.coordinator
            .handle_read(fx.recipient, message, fx.conversation)
            .await
            .unwrap();
        let late = fx
            .coordinator
            .handle_delivered(fx.recipient, message, fx.conversation)
            .await
            .unwrap();

        assert_eq!(
            late,
            DeliveryOutcome::Duplicate {
                current: MessageStatus::Read
            }
        );
        assert_eq!(fx.store.status_of(message, fx.recipient).await, MessageStatus::Read);
        assert_eq!(receipts(&mut fx.sender_rx), vec![("message.read", fx.recipient)]);
    }

    #[tokio::test]
    async fn persistence_failure_suppresses_broadcast() {
        let mut fx = fixture().await;
        fx.store.set_unavailable(true);

        let err = fx
            .coordinator
            .handle_read(fx.recipient, MessageId::random(), fx.conversation)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Persistence { .. }));
        assert!(receipts(&mut fx.sender_rx).is_empty());
    }

    #[tokio::test]
    async fn broadcast_failure_is_reported_after_persisting() {
        let mut store = MockMessageStatusStore::new();
        store.expect_update_status().times(1).returning(|_, _, _| {
            Ok(StatusTransition::Applied {
                from: MessageStatus::Sent,
                to: MessageStatus::Delivered,
            })
        });
        // 会话不存在，成员查询失败
        let hub = Arc::new(Hub::new(Arc::new(MemoryParticipantDirectory::new()), 10));
        let coordinator = DeliveryCoordinator::new(Arc::new(store), hub, Arc::new(SystemClock));

        let err = coordinator
            .handle_delivered(UserId::random(), MessageId::random(), ConversationId::random())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Broadcast {
                source: HubError::ParticipantLookup(RepositoryError::NotFound),
                ..
            }
        ));
    }
}
