//! 应用层实现。
//!
//! 实时投递的核心：连接与收发泵、连接注册表与扇出、在线 / 输入状态服务、
//! 送达与已读回执协调，以及对外部协作方（在线状态存储、会话成员、消息状态）的抽象。

pub mod clock;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod hub;
pub mod presence;
pub mod presence_store;
pub mod realtime;
pub mod repository;

pub use clock::{Clock, SystemClock};
pub use connection::{
    CloseFrame, CloseReason, Connection, ConnectionState, Frame, InboundHandler, Outbound,
    PumpSettings,
};
pub use delivery::{DeliveryCoordinator, DeliveryError, DeliveryOutcome};
pub use error::ApplicationError;
pub use hub::{
    BroadcastReport, Hub, HubError, HubStats, Registration, RegistryViolation, Unregistration,
};
pub use presence::{PresenceKeys, PresenceService, PresenceSettings};
pub use presence_store::{PresenceStore, PresenceStoreError};
pub use realtime::{Identity, Realtime, RealtimeDependencies, RealtimeSettings};
pub use repository::{MessageStatusStore, ParticipantDirectory};
