//! 实时事件定义
//!
//! 服务端下发的事件（[`Event`]）与客户端上报的信号（[`ClientEvent`]）
//! 都以 `{"type": "<dot.name>", "payload": {...}}` 的信封在连接上传输。

pub mod client;
pub mod codec;

use serde::{Deserialize, Serialize};

use crate::message_status::MessageStatus;
use crate::presence::PresenceStatus;
use crate::value_objects::{ConnectionId, ConversationId, MessageId, Timestamp, UserId};

pub use client::ClientEvent;
pub use codec::{decode, encode, CodecError, Envelope};

/// 事件类型名称
pub mod event_types {
    pub const TYPING_START: &str = "typing.start";
    pub const TYPING_STOP: &str = "typing.stop";
    pub const MESSAGE_DELIVERED: &str = "message.delivered";
    pub const MESSAGE_READ: &str = "message.read";
    pub const PRESENCE_UPDATE: &str = "presence.update";
    pub const PRESENCE_AWAY: &str = "presence.away";
    pub const PRESENCE_ONLINE: &str = "presence.online";
    pub const SESSION_READY: &str = "session.ready";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusPayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// 上报送达 / 已读的接收方
    pub user_id: UserId,
    pub status: MessageStatus,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReadyPayload {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
}

/// 服务端下发给连接的事件。构造一次，发送时按接收方分别序列化。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TypingStarted(TypingPayload),
    TypingStopped(TypingPayload),
    MessageDelivered(MessageStatusPayload),
    MessageRead(MessageStatusPayload),
    PresenceUpdate(PresencePayload),
    SessionReady(SessionReadyPayload),
}

impl Event {
    pub fn typing(conversation_id: ConversationId, user_id: UserId, is_typing: bool) -> Self {
        let payload = TypingPayload {
            conversation_id,
            user_id,
            is_typing,
        };
        if is_typing {
            Event::TypingStarted(payload)
        } else {
            Event::TypingStopped(payload)
        }
    }

    /// 回执事件；`status` 只能是 `delivered` 或 `read`，其余状态返回 `None`。
    pub fn receipt(
        message_id: MessageId,
        conversation_id: ConversationId,
        user_id: UserId,
        status: MessageStatus,
        timestamp: Timestamp,
    ) -> Option<Self> {
        let payload = MessageStatusPayload {
            message_id,
            conversation_id,
            user_id,
            status,
            timestamp,
        };
        match status {
            MessageStatus::Delivered => Some(Event::MessageDelivered(payload)),
            MessageStatus::Read => Some(Event::MessageRead(payload)),
            _ => None,
        }
    }

    pub fn presence(user_id: UserId, status: PresenceStatus, last_seen_at: Timestamp) -> Self {
        Event::PresenceUpdate(PresencePayload {
            user_id,
            status,
            last_seen_at,
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::TypingStarted(_) => event_types::TYPING_START,
            Event::TypingStopped(_) => event_types::TYPING_STOP,
            Event::MessageDelivered(_) => event_types::MESSAGE_DELIVERED,
            Event::MessageRead(_) => event_types::MESSAGE_READ,
            Event::PresenceUpdate(_) => event_types::PRESENCE_UPDATE,
            Event::SessionReady(_) => event_types::SESSION_READY,
        }
    }

    pub(crate) fn payload_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Event::TypingStarted(p) | Event::TypingStopped(p) => serde_json::to_value(p),
            Event::MessageDelivered(p) | Event::MessageRead(p) => serde_json::to_value(p),
            Event::PresenceUpdate(p) => serde_json::to_value(p),
            Event::SessionReady(p) => serde_json::to_value(p),
        }
    }
}
