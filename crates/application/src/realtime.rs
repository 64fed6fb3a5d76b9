//! 实时层门面
//!
//! 把 Hub、在线状态服务和回执协调器组装在一起，负责一条连接从注册到注销的完整生命周期，
//! 并作为入站泵的 [`InboundHandler`]。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::RealtimeConfig;
use domain::{
    ConnectionId, ConversationId, DisplayName, Event, MessageId, PresenceStatus,
    SessionReadyPayload, UserId,
};
use futures_util::{Sink, SinkExt, Stream};
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::connection::{
    CloseFrame, CloseReason, Connection, Frame, InboundHandler, Outbound, PumpSettings,
};
use crate::delivery::DeliveryCoordinator;
use crate::error::ApplicationError;
use crate::hub::{Hub, HubError, HubStats};
use crate::presence::{PresenceService, PresenceSettings};
use crate::presence_store::PresenceStore;
use crate::repository::{MessageStatusStore, ParticipantDirectory};

/// 上游认证得到的身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: DisplayName,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub queue_capacity: usize,
    pub max_connections: usize,
    pub pump: PumpSettings,
    pub presence: PresenceSettings,
}

impl RealtimeSettings {
    pub fn from_config(config: &RealtimeConfig, key_prefix: &str) -> Self {
        Self {
            queue_capacity: config.outbound_queue_capacity,
            max_connections: config.max_connections,
            pump: PumpSettings {
                read_deadline: config.read_deadline(),
                ping_interval: config.ping_interval(),
                heartbeat_interval: config.heartbeat_interval(),
                max_malformed_frames: config.max_malformed_frames,
                // 线上传输是 axum WebSocket，ping 已由协议层自动回复
                answer_pings: false,
            },
            presence: PresenceSettings {
                key_prefix: key_prefix.to_string(),
                presence_ttl: config.presence_ttl(),
                typing_ttl: config.typing_ttl(),
                offline_retention: config.offline_retention(),
            },
        }
    }
}

pub struct RealtimeDependencies {
    pub presence_store: Arc<dyn PresenceStore>,
    pub participants: Arc<dyn ParticipantDirectory>,
    pub message_status: Arc<dyn MessageStatusStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct Realtime {
    hub: Arc<Hub>,
    presence: PresenceService,
    delivery: DeliveryCoordinator,
    clock: Arc<dyn Clock>,
    settings: RealtimeSettings,
}

impl Realtime {
    pub fn new(deps: RealtimeDependencies, settings: RealtimeSettings) -> Self {
        let RealtimeDependencies {
            presence_store,
            participants,
            message_status,
            clock,
        } = deps;

        let hub = Arc::new(Hub::new(participants, settings.max_connections));
        let presence = PresenceService::new(
            presence_store,
            hub.clone(),
            clock.clone(),
            settings.presence.clone(),
        );
        let delivery = DeliveryCoordinator::new(message_status, hub.clone(), clock.clone());

        Self {
            hub,
            presence,
            delivery,
            clock,
            settings,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    pub fn delivery(&self) -> &DeliveryCoordinator {
        &self.delivery
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    pub fn stats(&self) -> HubStats {
        self.hub.stats()
    }

    fn presence_ttl(&self) -> Duration {
        self.settings.presence.presence_ttl
    }

    /// 创建并注册连接：续约在线状态，发送欢迎帧，
    /// 如果是该用户的第一条连接则向所有人广播上线。
    pub async fn connect(
        &self,
        identity: Identity,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Outbound>), HubError> {
        let (connection, queue) = Connection::new(
            ConnectionId::random(),
            identity.user_id,
            identity.display_name,
            self.settings.queue_capacity,
            self.clock.now(),
        );
        let registration = self.hub.register(connection.clone()).await?;

        connection.send(Arc::new(Event::SessionReady(SessionReadyPayload {
            connection_id: connection.id(),
            user_id: connection.user_id(),
            display_name: connection.display_name().to_string(),
        })));

        let user_id = connection.user_id();
        self.presence.heartbeat(user_id, self.presence_ttl()).await;
        if registration.first_for_user {
            self.hub
                .broadcast_to_all(Event::presence(
                    user_id,
                    PresenceStatus::Online,
                    self.clock.now(),
                ))
                .await;
        }
        Ok((connection, queue))
    }

    /// 注销连接；最后一条连接断开时标记离线并广播
    pub async fn disconnect(&self, connection: &Arc<Connection>) {
        let outcome = self.hub.unregister(connection).await;
        if !outcome.last_for_user {
            return;
        }

        let user_id = connection.user_id();
        self.presence.mark_offline(user_id).await;
        let offline = Event::presence(user_id, PresenceStatus::Offline, self.clock.now());
        if self
            .hub
            .broadcast_to_all_unless_connected(user_id, offline)
            .await
            .is_none()
        {
            // 离线写入期间用户又连上了
            self.presence.heartbeat(user_id, self.presence_ttl()).await;
        }
    }

    /// 驱动一条连接直到结束，返回关闭原因。
    ///
    /// 注册成功后连接的生命周期归这里所有：两个泵都退出后才注销。
    pub async fn serve<S, St, E>(
        &self,
        identity: Identity,
        mut sink: S,
        stream: St,
    ) -> Result<CloseReason, HubError>
    where
        S: Sink<Frame> + Unpin,
        S::Error: fmt::Display,
        St: Stream<Item = Result<Frame, E>> + Unpin,
        E: fmt::Display,
    {
        let user_id = identity.user_id;
        let (connection, queue) = match self.connect(identity).await {
            Ok(registered) => registered,
            Err(err) => {
                let farewell = CloseFrame {
                    code: err.close_code(),
                    reason: err.to_string(),
                };
                let _ = tokio::time::timeout(
                    Duration::from_secs(1),
                    sink.send(Frame::Close(Some(farewell))),
                )
                .await;
                return Err(err);
            }
        };

        tracing::info!(
            connection_id = %connection.id(),
            user_id = %user_id,
            "实时连接开始服务"
        );

        let pump = self.settings.pump;
        tokio::join!(
            connection.run_outbound(queue, sink, pump.ping_interval),
            connection.run_inbound(stream, self, pump),
        );

        self.disconnect(&connection).await;
        let reason = connection
            .close_reason()
            .cloned()
            .unwrap_or(CloseReason::ClientClosed);
        tracing::info!(
            connection_id = %connection.id(),
            user_id = %user_id,
            reason = %reason,
            "实时连接结束"
        );
        Ok(reason)
    }
}

#[async_trait]
impl InboundHandler for Realtime {
    async fn renew_presence(&self, user_id: UserId, status: PresenceStatus) {
        match status {
            PresenceStatus::Away => self.presence.set_away(user_id, self.presence_ttl()).await,
            _ => self.presence.heartbeat(user_id, self.presence_ttl()).await,
        }
    }

    async fn change_presence(&self, user_id: UserId, status: PresenceStatus) {
        self.renew_presence(user_id, status).await;
        self.hub
            .broadcast_to_all(Event::presence(user_id, status, self.clock.now()))
            .await;
    }

    async fn start_typing(&self, conversation_id: ConversationId, user_id: UserId) {
        self.presence.set_typing(conversation_id, user_id).await;
    }

    async fn stop_typing(&self, conversation_id: ConversationId, user_id: UserId) {
        self.presence.clear_typing(conversation_id, user_id).await;
    }

    async fn message_delivered(
        &self,
        user_id: UserId,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError> {
        self.delivery
            .handle_delivered(user_id, message_id, conversation_id)
            .await?;
        Ok(())
    }

    async fn message_read(
        &self,
        user_id: UserId,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError> {
        self.delivery
            .handle_read(user_id, message_id, conversation_id)
            .await?;
        Ok(())
    }
}
