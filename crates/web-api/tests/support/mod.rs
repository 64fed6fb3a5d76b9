#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::presence_store::memory::MemoryPresenceStore;
use application::repository::memory::{MemoryMessageStatusStore, MemoryParticipantDirectory};
use application::{
    PresenceSettings, PumpSettings, Realtime, RealtimeDependencies, RealtimeSettings, SystemClock,
};
use domain::{DisplayName, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use web_api::{router, AppState, JwtConfig, JwtService, OriginPolicy};

pub const WAIT: Duration = Duration::from_secs(3);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    pub realtime: Arc<Realtime>,
    pub directory: Arc<MemoryParticipantDirectory>,
    pub statuses: Arc<MemoryMessageStatusStore>,
    shutdown: Option<oneshot::Sender<()>>,
}

fn settings() -> RealtimeSettings {
    RealtimeSettings {
        queue_capacity: 32,
        max_connections: 100,
        pump: PumpSettings {
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(25),
            heartbeat_interval: Duration::from_secs(20),
            max_malformed_frames: 3,
            answer_pings: false,
        },
        presence: PresenceSettings {
            key_prefix: "web".into(),
            presence_ttl: Duration::from_secs(45),
            typing_ttl: Duration::from_secs(5),
            offline_retention: Duration::from_secs(3600),
        },
    }
}

/// 用内存存储启动一个完整的 HTTP 服务
pub async fn spawn_server(allowed_origins: &[&str]) -> TestServer {
    let directory = Arc::new(MemoryParticipantDirectory::new());
    let statuses = Arc::new(MemoryMessageStatusStore::new());
    let realtime = Arc::new(Realtime::new(
        RealtimeDependencies {
            presence_store: Arc::new(MemoryPresenceStore::new()),
            participants: directory.clone(),
            message_status: statuses.clone(),
            clock: Arc::new(SystemClock),
        },
        settings(),
    ));
    let jwt = Arc::new(JwtService::new(JwtConfig {
        secret: "web-api-test-secret".to_string(),
        expiration_hours: 1,
    }));
    let state = AppState::new(
        realtime.clone(),
        jwt.clone(),
        Arc::new(OriginPolicy::new(allowed_origins.iter().copied())),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state);

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    // 等待服务器启动
    sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        jwt,
        realtime,
        directory,
        statuses,
        shutdown: Some(shutdown_tx),
    }
}

impl TestServer {
    pub fn token(&self, user_id: UserId, name: &str) -> String {
        self.jwt
            .generate_token(user_id, &DisplayName::parse(name).unwrap())
            .expect("token")
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/api/v1/ws?token={}", self.addr, token)
    }

    pub async fn connect(&self, user_id: UserId, name: &str) -> WsClient {
        let (socket, _) = connect_async(self.ws_url(&self.token(user_id, name)))
            .await
            .expect("websocket connect");
        socket
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn send_json(socket: &mut WsClient, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// 读到满足条件的事件为止，跳过其他帧
pub async fn expect_event(
    socket: &mut WsClient,
    event_type: &str,
    accept: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let message = tokio::time::timeout_at(deadline, socket.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
            .unwrap_or_else(|| panic!("socket closed while waiting for {event_type}"))
            .expect("websocket error");
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
            if value["type"] == event_type && accept(&value["payload"]) {
                return value;
            }
        }
    }
}

/// 轮询直到条件成立
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition never held: {what}");
}
