//! 客户端上报的信号
//!
//! 发送者身份一律取自连接本身，payload 里自带的 `userId` 等字段会被忽略。

use serde::Deserialize;

use super::codec::{self, CodecError, Envelope};
use super::event_types;
use crate::value_objects::{ConversationId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingSignal {
    conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptSignal {
    message_id: MessageId,
    conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    MessageDelivered {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    MessageRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    PresenceAway,
    PresenceOnline,
}

impl ClientEvent {
    /// 解码一帧客户端数据。
    ///
    /// * 信封损坏或已知类型的 payload 结构不对：`Err(CodecError::Decoding)`
    /// * 未知类型：`Ok(None)`，直接忽略
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, CodecError> {
        Self::from_envelope(codec::decode(bytes)?)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, CodecError> {
        let Envelope {
            event_type,
            payload,
            ..
        } = envelope;

        let event = match event_type.as_str() {
            event_types::TYPING_START => {
                let signal: TypingSignal = codec::payload(&event_type, payload)?;
                ClientEvent::TypingStart {
                    conversation_id: signal.conversation_id,
                }
            }
            event_types::TYPING_STOP => {
                let signal: TypingSignal = codec::payload(&event_type, payload)?;
                ClientEvent::TypingStop {
                    conversation_id: signal.conversation_id,
                }
            }
            event_types::MESSAGE_DELIVERED => {
                let signal: ReceiptSignal = codec::payload(&event_type, payload)?;
                ClientEvent::MessageDelivered {
                    message_id: signal.message_id,
                    conversation_id: signal.conversation_id,
                }
            }
            event_types::MESSAGE_READ => {
                let signal: ReceiptSignal = codec::payload(&event_type, payload)?;
                ClientEvent::MessageRead {
                    message_id: signal.message_id,
                    conversation_id: signal.conversation_id,
                }
            }
            event_types::PRESENCE_AWAY => ClientEvent::PresenceAway,
            event_types::PRESENCE_ONLINE => ClientEvent::PresenceOnline,
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}
