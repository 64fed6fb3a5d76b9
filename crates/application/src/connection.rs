//! 单条实时连接
//!
//! 每条连接由两个并发的泵组成：
//! - 入站泵：逐帧读取、解码、分发给 [`InboundHandler`]，维护读超时并回应 ping；
//! - 出站泵：从私有的有界队列取事件，按接收方编码后写入传输层，并定时发送 ping。
//!
//! 两个泵只通过队列和关闭信号通信。队列写满时连接被直接关闭，广播方永远不会被阻塞。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ClientEvent, ConnectionId, ConversationId, DisplayName, Event, MessageId, PresenceStatus,
    Timestamp, UserId,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ApplicationError;

/// 关闭帧最多等待这么久，写不出去就直接放弃。
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// 与传输层无关的帧，web 层负责和 websocket 消息互转。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Active,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// 连接关闭的原因，第一个原因生效
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadTimeout,
    ProtocolViolation(String),
    SlowConsumer,
    Transport(String),
    RegistryConflict,
    ServerShutdown,
    Evicted,
}

impl CloseReason {
    /// 对应的 websocket 关闭码
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed | CloseReason::Evicted => 1000,
            CloseReason::ReadTimeout | CloseReason::ServerShutdown => 1001,
            CloseReason::ProtocolViolation(_) => 1002,
            CloseReason::SlowConsumer => 1008,
            CloseReason::Transport(_) => 1006,
            CloseReason::RegistryConflict => 1011,
        }
    }

    /// 传输已经断了或者对端主动关闭时不再回关闭帧
    fn sends_close_frame(&self) -> bool {
        !matches!(self, CloseReason::ClientClosed | CloseReason::Transport(_))
    }

    pub fn close_frame(&self) -> CloseFrame {
        CloseFrame {
            code: self.code(),
            reason: self.to_string(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::ReadTimeout => f.write_str("read deadline exceeded"),
            CloseReason::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            CloseReason::SlowConsumer => f.write_str("outbound queue overflow"),
            CloseReason::Transport(detail) => write!(f, "transport error: {detail}"),
            CloseReason::RegistryConflict => f.write_str("registry conflict"),
            CloseReason::ServerShutdown => f.write_str("server shutting down"),
            CloseReason::Evicted => f.write_str("evicted"),
        }
    }
}

/// 出站队列里的条目
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<Event>),
    Pong(Vec<u8>),
}

/// 泵的时间参数
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub read_deadline: Duration,
    pub ping_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_malformed_frames: u32,
    /// 是否由入站泵回复 ping。
    ///
    /// axum / tungstenite 的 WebSocket 会自动回 pong，这时必须关掉，否则对端每个 ping 收到两个 pong；
    /// 不会自动回复的传输（例如内存通道）需要打开。
    pub answer_pings: bool,
}

/// 入站帧的分发目标
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// 周期性续约，`status` 是连接当前声明的状态
    async fn renew_presence(&self, user_id: UserId, status: PresenceStatus);

    /// 客户端主动切换 away / online
    async fn change_presence(&self, user_id: UserId, status: PresenceStatus);

    async fn start_typing(&self, conversation_id: ConversationId, user_id: UserId);

    async fn stop_typing(&self, conversation_id: ConversationId, user_id: UserId);

    async fn message_delivered(
        &self,
        user_id: UserId,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError>;

    async fn message_read(
        &self,
        user_id: UserId,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError>;
}

pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    display_name: DisplayName,
    queue: mpsc::Sender<Outbound>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    shutdown: CancellationToken,
    connected_at: Timestamp,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// 创建连接以及它的出站队列接收端（交给出站泵）
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        display_name: DisplayName,
        queue_capacity: usize,
        connected_at: Timestamp,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (queue, receiver) = mpsc::channel(queue_capacity.max(1));
        let connection = Arc::new(Self {
            id,
            user_id,
            display_name,
            queue,
            state: AtomicU8::new(0),
            close_reason: OnceLock::new(),
            shutdown: CancellationToken::new(),
            connected_at,
        });
        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn display_name(&self) -> &DisplayName {
        &self.display_name
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }

    /// 非阻塞投递。返回是否入队；队列满时连接被关闭，不向调用方报错。
    pub fn send(&self, event: Arc<Event>) -> bool {
        self.enqueue(Outbound::Event(event))
    }

    pub fn enqueue(&self, item: Outbound) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.queue.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    user_id = %self.user_id,
                    "出站队列已满，断开慢连接"
                );
                self.close(CloseReason::SlowConsumer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(CloseReason::Transport("outbound queue closed".into()));
                false
            }
        }
    }

    /// 进入 Closing。只有第一次调用生效，返回是否由本次调用触发。
    pub fn close(&self, reason: CloseReason) -> bool {
        let switched = self
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if switched {
            tracing::info!(
                connection_id = %self.id,
                user_id = %self.user_id,
                reason = %reason,
                "连接进入关闭流程"
            );
            let _ = self.close_reason.set(reason);
            self.shutdown.cancel();
        }
        switched
    }

    /// 两个泵都退出、从注册表移除之后调用
    pub fn mark_closed(&self) {
        if self.is_active() {
            self.close(CloseReason::Evicted);
        }
        self.state.store(2, Ordering::SeqCst);
    }

    /// 等待连接进入 Closing
    pub async fn closing(&self) {
        self.shutdown.cancelled().await
    }

    /// 出站泵：队列 → 传输层，直到连接关闭或写失败。
    pub async fn run_outbound<S>(
        &self,
        mut queue: mpsc::Receiver<Outbound>,
        mut sink: S,
        ping_interval: Duration,
    ) where
        S: Sink<Frame> + Unpin,
        S::Error: fmt::Display,
    {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.closing() => break,
                item = queue.recv() => match item {
                    Some(Outbound::Event(event)) => match domain::encode(&event) {
                        Ok(text) => Frame::Text(text),
                        Err(err) => {
                            tracing::error!(
                                connection_id = %self.id,
                                error = %err,
                                "事件编码失败，跳过"
                            );
                            continue;
                        }
                    },
                    Some(Outbound::Pong(data)) => Frame::Pong(data),
                    None => break,
                },
                _ = ping.tick() => Frame::Ping(Vec::new()),
            };

            let written = tokio::select! {
                biased;
                _ = self.closing() => break,
                result = sink.send(frame) => result,
            };
            if let Err(err) = written {
                self.close(CloseReason::Transport(err.to_string()));
                break;
            }
        }

        queue.close();
        let reason = self
            .close_reason()
            .cloned()
            .unwrap_or(CloseReason::ClientClosed);
        if reason.sends_close_frame() {
            let farewell = async {
                sink.send(Frame::Close(Some(reason.close_frame()))).await?;
                sink.close().await
            };
            match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, farewell).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(connection_id = %self.id, error = %err, "关闭帧发送失败");
                }
                Err(_) => {
                    tracing::debug!(connection_id = %self.id, "关闭帧发送超时");
                }
            }
        }
        tracing::debug!(connection_id = %self.id, "出站泵结束");
    }

    /// 入站泵：逐帧读取并分发，直到连接关闭、读超时或传输出错。
    pub async fn run_inbound<St, E, H>(&self, mut stream: St, handler: &H, settings: PumpSettings)
    where
        St: Stream<Item = Result<Frame, E>> + Unpin,
        E: fmt::Display,
        H: InboundHandler + ?Sized,
    {
        let deadline = tokio::time::sleep(settings.read_deadline);
        tokio::pin!(deadline);
        let mut heartbeat = interval_at(
            Instant::now() + settings.heartbeat_interval,
            settings.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut status = PresenceStatus::Online;
        let mut malformed = 0u32;

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.closing() => break None,
                _ = &mut deadline => break Some(CloseReason::ReadTimeout),
                _ = heartbeat.tick() => {
                    handler.renew_presence(self.user_id, status).await;
                }
                item = stream.next() => {
                    deadline
                        .as_mut()
                        .reset(Instant::now() + settings.read_deadline);
                    let frame = match item {
                        None => break Some(CloseReason::ClientClosed),
                        Some(Err(err)) => break Some(CloseReason::Transport(err.to_string())),
                        Some(Ok(frame)) => frame,
                    };
                    let bytes = match frame {
                        Frame::Close(_) => break Some(CloseReason::ClientClosed),
                        Frame::Ping(data) => {
                            if settings.answer_pings {
                                self.enqueue(Outbound::Pong(data));
                            }
                            continue;
                        }
                        Frame::Pong(_) => continue,
                        Frame::Text(text) => text.into_bytes(),
                        Frame::Binary(bytes) => bytes,
                    };
                    match ClientEvent::decode(&bytes) {
                        Ok(Some(event)) => self.dispatch(event, handler, &mut status).await,
                        Ok(None) => {
                            tracing::debug!(connection_id = %self.id, "忽略未知类型的帧");
                        }
                        Err(err) => {
                            malformed += 1;
                            tracing::warn!(
                                connection_id = %self.id,
                                user_id = %self.user_id,
                                malformed,
                                error = %err,
                                "收到畸形帧"
                            );
                            if malformed >= settings.max_malformed_frames {
                                break Some(CloseReason::ProtocolViolation(err.to_string()));
                            }
                        }
                    }
                }
            }
        };

        if let Some(reason) = reason {
            self.close(reason);
        }
        tracing::debug!(connection_id = %self.id, "入站泵结束");
    }

    async fn dispatch<H>(&self, event: ClientEvent, handler: &H, status: &mut PresenceStatus)
    where
        H: InboundHandler + ?Sized,
    {
        tracing::debug!(connection_id = %self.id, event = ?event, "分发入站事件");
        let user_id = self.user_id;
        let result = match event {
            ClientEvent::TypingStart { conversation_id } => {
                handler.start_typing(conversation_id, user_id).await;
                Ok(())
            }
            ClientEvent::TypingStop { conversation_id } => {
                handler.stop_typing(conversation_id, user_id).await;
                Ok(())
            }
            ClientEvent::MessageDelivered {
                message_id,
                conversation_id,
            } => {
                handler
                    .message_delivered(user_id, message_id, conversation_id)
                    .await
            }
            ClientEvent::MessageRead {
                message_id,
                conversation_id,
            } => handler.message_read(user_id, message_id, conversation_id).await,
            ClientEvent::PresenceAway => {
                *status = PresenceStatus::Away;
                handler.change_presence(user_id, PresenceStatus::Away).await;
                Ok(())
            }
            ClientEvent::PresenceOnline => {
                *status = PresenceStatus::Online;
                handler.change_presence(user_id, PresenceStatus::Online).await;
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::warn!(
                connection_id = %self.id,
                user_id = %user_id,
                error = %err,
                "入站事件处理失败"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use chrono::Utc;
    use domain::event_types;

    /// 不关心入站事件的处理器
    struct IgnoreAll;

    #[async_trait]
    impl InboundHandler for IgnoreAll {
        async fn renew_presence(&self, _user_id: UserId, _status: PresenceStatus) {}

        async fn change_presence(&self, _user_id: UserId, _status: PresenceStatus) {}

        async fn start_typing(&self, _conversation_id: ConversationId, _user_id: UserId) {}

        async fn stop_typing(&self, _conversation_id: ConversationId, _user_id: UserId) {}

        async fn message_delivered(
            &self,
            _user_id: UserId,
            _message_id: MessageId,
            _conversation_id: ConversationId,
        ) -> Result<(), ApplicationError> {
            Ok(())
        }

        async fn message_read(
            &self,
            _user_id: UserId,
            _message_id: MessageId,
            _conversation_id: ConversationId,
        ) -> Result<(), ApplicationError> {
            Ok(())
        }
    }

    fn pump_settings(answer_pings: bool) -> PumpSettings {
        PumpSettings {
            read_deadline: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            max_malformed_frames: 1,
            answer_pings,
        }
    }

    fn connection(capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        Connection::new(
            ConnectionId::random(),
            UserId::random(),
            DisplayName::parse("alice").unwrap(),
            capacity,
            Utc::now(),
        )
    }

    fn typing_event() -> Arc<Event> {
        Arc::new(Event::typing(ConversationId::random(), UserId::random(), true))
    }

    #[test]
    fn send_enqueues_while_active() {
        let (conn, mut rx) = connection(4);
        assert!(conn.send(typing_event()));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Event(_))));
    }

    #[test]
    fn overflow_closes_instead_of_blocking() {
        let (conn, _rx) = connection(2);
        assert!(conn.send(typing_event()));
        assert!(conn.send(typing_event()));
        assert!(!conn.send(typing_event()));

        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.close_reason(), Some(&CloseReason::SlowConsumer));
        assert!(!conn.send(typing_event()));
    }

    #[test]
    fn first_close_reason_wins() {
        let (conn, _rx) = connection(2);
        assert!(conn.close(CloseReason::ReadTimeout));
        assert!(!conn.close(CloseReason::ServerShutdown));
        assert_eq!(conn.close_reason(), Some(&CloseReason::ReadTimeout));

        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::ProtocolViolation("x".into()).code(), 1002);
        assert_eq!(CloseReason::SlowConsumer.code(), 1008);
        assert_eq!(CloseReason::ReadTimeout.code(), 1001);
        assert_eq!(CloseReason::ServerShutdown.code(), 1001);
        assert_eq!(CloseReason::RegistryConflict.code(), 1011);
    }

    #[tokio::test]
    async fn outbound_pump_writes_events_in_order_then_close_frame() {
        let (conn, rx) = connection(8);
        let (sink, mut written) = futures::channel::mpsc::unbounded::<Frame>();

        let conversation = ConversationId::random();
        let first = UserId::random();
        let second = UserId::random();
        conn.send(Arc::new(Event::typing(conversation, first, true)));
        conn.send(Arc::new(Event::typing(conversation, second, true)));

        let pump = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.run_outbound(rx, sink, Duration::from_secs(30)).await;
            })
        };

        for expected in [first, second] {
            let Some(Frame::Text(text)) = written.next().await else {
                panic!("expected text frame");
            };
            let envelope = domain::decode(text.as_bytes()).unwrap();
            assert_eq!(envelope.event_type, event_types::TYPING_START);
            assert_eq!(envelope.payload["userId"], expected.to_string());
            assert!(envelope.server_timestamp.is_some());
        }

        conn.close(CloseReason::ServerShutdown);
        pump.await.unwrap();

        let Some(Frame::Close(Some(frame))) = written.next().await else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1001);
    }

    #[tokio::test]
    async fn inbound_pump_answers_pings_when_transport_does_not() {
        let (conn, mut rx) = connection(4);
        let frames = futures::stream::iter(vec![Ok::<_, Infallible>(Frame::Ping(b"hi".to_vec()))]);

        conn.run_inbound(frames, &IgnoreAll, pump_settings(true)).await;

        assert!(matches!(rx.try_recv(), Ok(Outbound::Pong(data)) if data == b"hi".to_vec()));
        assert_eq!(conn.close_reason(), Some(&CloseReason::ClientClosed));
    }

    #[tokio::test]
    async fn inbound_pump_leaves_pings_to_auto_replying_transport() {
        let (conn, mut rx) = connection(4);
        let frames = futures::stream::iter(vec![Ok::<_, Infallible>(Frame::Ping(b"hi".to_vec()))]);

        conn.run_inbound(frames, &IgnoreAll, pump_settings(false)).await;

        assert!(rx.try_recv().is_err());
    }
}
