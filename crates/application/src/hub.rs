//! 连接注册表与事件扇出
//!
//! 注册表只在 register / unregister 中修改，临界区内不做任何 I/O。
//! 广播先在锁外解析会话成员，再在读锁下取快照，释放锁后逐个 `send`。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use domain::{ConnectionId, ConversationId, Event, RepositoryError, UserId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::connection::{CloseReason, Connection};
use crate::repository::ParticipantDirectory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("participant lookup failed: {0}")]
    ParticipantLookup(#[source] RepositoryError),
    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("connection id {connection_id} is already registered to another connection")]
    RegistryConflict { connection_id: ConnectionId },
    #[error("connection is no longer active")]
    ConnectionClosed,
}

impl HubError {
    /// 注册失败时告知客户端的关闭码
    pub fn close_code(&self) -> u16 {
        match self {
            // try again later
            HubError::CapacityExceeded { .. } => 1013,
            HubError::RegistryConflict { .. } => CloseReason::RegistryConflict.code(),
            HubError::ParticipantLookup(_) | HubError::ConnectionClosed => 1011,
        }
    }
}

/// 注册表不变量被破坏
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryViolation {
    #[error("connection {connection_id} missing from the set of user {user_id}")]
    MissingFromUser {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    #[error("user {user_id} references unknown connection {connection_id}")]
    DanglingConnection {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    #[error("user {user_id} has an empty connection set")]
    EmptyUserSet { user_id: UserId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// 该用户在本实例上的第一条连接
    pub first_for_user: bool,
    /// false 表示同一连接重复注册
    pub newly_registered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistration {
    pub removed: bool,
    /// 该用户已经没有任何连接
    pub last_for_user: bool,
}

/// 一次广播的投递统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: usize,
}

impl BroadcastReport {
    fn record(&mut self, delivered: bool) {
        self.recipients += 1;
        if delivered {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub active_connections: usize,
    pub online_users: usize,
    pub total_registered: u64,
    pub peak_connections: usize,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
    fn snapshot_users(&self, users: &[UserId], except: Option<UserId>) -> Vec<Arc<Connection>> {
        let mut seen = HashSet::with_capacity(users.len());
        users
            .iter()
            .filter(|user_id| Some(**user_id) != except && seen.insert(**user_id))
            .filter_map(|user_id| self.users.get(user_id))
            .flat_map(|ids| ids.iter().filter_map(|id| self.connections.get(id)))
            .cloned()
            .collect()
    }

    fn verify(&self) -> Result<(), RegistryViolation> {
        for (connection_id, connection) in &self.connections {
            let user_id = connection.user_id();
            let owned = self
                .users
                .get(&user_id)
                .is_some_and(|ids| ids.contains(connection_id));
            if !owned {
                return Err(RegistryViolation::MissingFromUser {
                    connection_id: *connection_id,
                    user_id,
                });
            }
        }
        for (user_id, ids) in &self.users {
            if ids.is_empty() {
                return Err(RegistryViolation::EmptyUserSet { user_id: *user_id });
            }
            for connection_id in ids {
                let matches = self
                    .connections
                    .get(connection_id)
                    .is_some_and(|connection| connection.user_id() == *user_id);
                if !matches {
                    return Err(RegistryViolation::DanglingConnection {
                        connection_id: *connection_id,
                        user_id: *user_id,
                    });
                }
            }
        }
        Ok(())
    }
}

pub struct Hub {
    registry: RwLock<Registry>,
    participants: Arc<dyn ParticipantDirectory>,
    max_connections: usize,
    active: AtomicUsize,
    online_users: AtomicUsize,
    total_registered: AtomicU64,
    peak: AtomicUsize,
}

impl Hub {
    pub fn new(participants: Arc<dyn ParticipantDirectory>, max_connections: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            participants,
            max_connections,
            active: AtomicUsize::new(0),
            online_users: AtomicUsize::new(0),
            total_registered: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// 注册连接。同一个连接重复注册是无操作；
    /// 同一个 id 对应另一个连接对象视为注册表冲突，新连接被关闭。
    pub async fn register(&self, connection: Arc<Connection>) -> Result<Registration, HubError> {
        if !connection.is_active() {
            return Err(HubError::ConnectionClosed);
        }

        let connection_id = connection.id();
        let user_id = connection.user_id();
        let outcome = {
            let mut registry = self.registry.write().await;
            match registry.connections.get(&connection_id) {
                Some(existing) if Arc::ptr_eq(existing, &connection) => Ok(Registration {
                    first_for_user: false,
                    newly_registered: false,
                }),
                Some(_) => Err(HubError::RegistryConflict { connection_id }),
                None if registry.connections.len() >= self.max_connections => {
                    Err(HubError::CapacityExceeded {
                        limit: self.max_connections,
                    })
                }
                None => {
                    registry
                        .connections
                        .insert(connection_id, connection.clone());
                    let ids = registry.users.entry(user_id).or_default();
                    let first_for_user = ids.is_empty();
                    ids.insert(connection_id);

                    let active = registry.connections.len();
                    self.active.store(active, Ordering::SeqCst);
                    self.online_users
                        .store(registry.users.len(), Ordering::SeqCst);
                    self.peak.fetch_max(active, Ordering::SeqCst);
                    self.total_registered.fetch_add(1, Ordering::SeqCst);
                    Ok(Registration {
                        first_for_user,
                        newly_registered: true,
                    })
                }
            }
        };

        match &outcome {
            Ok(registration) if registration.newly_registered => {
                tracing::info!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    first_for_user = registration.first_for_user,
                    "连接已注册"
                );
            }
            Ok(_) => {
                tracing::debug!(connection_id = %connection_id, "重复注册，忽略");
            }
            Err(HubError::RegistryConflict { .. }) => {
                tracing::error!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    "连接 id 冲突，关闭新连接"
                );
                connection.close(CloseReason::RegistryConflict);
            }
            Err(err) => {
                tracing::warn!(connection_id = %connection_id, error = %err, "拒绝注册连接");
            }
        }
        outcome
    }

    /// 移除连接并把它标记为 Closed。在线状态的变化由调用方处理。
    pub async fn unregister(&self, connection: &Arc<Connection>) -> Unregistration {
        let connection_id = connection.id();
        let user_id = connection.user_id();

        let (outcome, violation) = {
            let mut registry = self.registry.write().await;
            let removed = match registry.connections.get(&connection_id) {
                Some(existing) if Arc::ptr_eq(existing, connection) => {
                    registry.connections.remove(&connection_id);
                    true
                }
                _ => false,
            };

            let mut violation = None;
            let mut last_for_user = false;
            if removed {
                match registry.users.get_mut(&user_id) {
                    Some(ids) => {
                        if !ids.remove(&connection_id) {
                            violation = Some(RegistryViolation::MissingFromUser {
                                connection_id,
                                user_id,
                            });
                        }
                        if ids.is_empty() {
                            registry.users.remove(&user_id);
                            last_for_user = true;
                        }
                    }
                    None => {
                        violation = Some(RegistryViolation::MissingFromUser {
                            connection_id,
                            user_id,
                        });
                        last_for_user = true;
                    }
                }
            } else if let Some(ids) = registry.users.get_mut(&user_id) {
                // id 表里没有它，用户集合里却还挂着
                if ids.remove(&connection_id) {
                    violation = Some(RegistryViolation::DanglingConnection {
                        connection_id,
                        user_id,
                    });
                    if ids.is_empty() {
                        registry.users.remove(&user_id);
                    }
                }
            }

            self.active
                .store(registry.connections.len(), Ordering::SeqCst);
            self.online_users
                .store(registry.users.len(), Ordering::SeqCst);
            (
                Unregistration {
                    removed,
                    last_for_user,
                },
                violation,
            )
        };

        if let Some(violation) = violation {
            tracing::error!(
                connection_id = %connection_id,
                user_id = %user_id,
                violation = %violation,
                "注册表不变量被破坏"
            );
            connection.close(CloseReason::RegistryConflict);
        }

        connection.mark_closed();
        if outcome.removed {
            tracing::info!(
                connection_id = %connection_id,
                user_id = %user_id,
                last_for_user = outcome.last_for_user,
                "连接已注销"
            );
        }
        outcome
    }

    /// 广播给会话的全部在线成员
    pub async fn broadcast_to_conversation(
        &self,
        conversation_id: ConversationId,
        event: Event,
    ) -> Result<BroadcastReport, HubError> {
        self.fan_out_conversation(conversation_id, None, event).await
    }

    /// 广播给会话成员，但跳过 `except` 用户的所有连接
    pub async fn broadcast_to_conversation_except(
        &self,
        conversation_id: ConversationId,
        except: UserId,
        event: Event,
    ) -> Result<BroadcastReport, HubError> {
        self.fan_out_conversation(conversation_id, Some(except), event)
            .await
    }

    async fn fan_out_conversation(
        &self,
        conversation_id: ConversationId,
        except: Option<UserId>,
        event: Event,
    ) -> Result<BroadcastReport, HubError> {
        let participants = self
            .participants
            .participants(conversation_id)
            .await
            .map_err(|err| {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "查询会话成员失败"
                );
                HubError::ParticipantLookup(err)
            })?;

        let targets = self
            .registry
            .read()
            .await
            .snapshot_users(&participants, except);
        let report = Self::deliver(&targets, event);
        tracing::debug!(
            conversation_id = %conversation_id,
            recipients = report.recipients,
            dropped = report.dropped,
            "会话广播完成"
        );
        Ok(report)
    }

    /// 发给某个用户的全部连接
    pub async fn broadcast_to_user(&self, user_id: UserId, event: Event) -> BroadcastReport {
        let targets = self.registry.read().await.snapshot_users(&[user_id], None);
        Self::deliver(&targets, event)
    }

    /// 发给所有已注册连接
    pub async fn broadcast_to_all(&self, event: Event) -> BroadcastReport {
        let targets: Vec<Arc<Connection>> = self
            .registry
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect();
        Self::deliver(&targets, event)
    }

    /// 用户在本实例上已经没有连接时才向所有连接广播；返回 `None` 表示用户仍有连接。
    ///
    /// 检查与入队在同一个读锁内完成（`send` 只入队不做 I/O），
    /// 之后的注册拿到写锁时，这条事件已经排在所有现存连接的队列里。
    pub async fn broadcast_to_all_unless_connected(
        &self,
        user_id: UserId,
        event: Event,
    ) -> Option<BroadcastReport> {
        let registry = self.registry.read().await;
        if registry.users.contains_key(&user_id) {
            return None;
        }
        let targets: Vec<Arc<Connection>> = registry.connections.values().cloned().collect();
        Some(Self::deliver(&targets, event))
    }

    fn deliver(targets: &[Arc<Connection>], event: Event) -> BroadcastReport {
        let event = Arc::new(event);
        let mut report = BroadcastReport::default();
        for connection in targets {
            report.record(connection.send(event.clone()));
        }
        report
    }

    /// O(1)，不加锁
    pub fn stats(&self) -> HubStats {
        HubStats {
            active_connections: self.active.load(Ordering::SeqCst),
            online_users: self.online_users.load(Ordering::SeqCst),
            total_registered: self.total_registered.load(Ordering::SeqCst),
            peak_connections: self.peak.load(Ordering::SeqCst),
        }
    }

    pub async fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        let registry = self.registry.read().await;
        registry
            .users
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, user_id: UserId) -> bool {
        self.registry.read().await.users.contains_key(&user_id)
    }

    /// 检查双向映射是否一致
    pub async fn verify(&self) -> Result<(), RegistryViolation> {
        self.registry.read().await.verify()
    }

    /// 关闭所有连接（停机时使用），返回被关闭的数量
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let connections: Vec<Arc<Connection>> = self
            .registry
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect();
        connections
            .iter()
            .filter(|connection| connection.close(reason.clone()))
            .count()
    }
}
