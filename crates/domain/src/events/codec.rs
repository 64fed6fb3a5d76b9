//! 事件编解码
//!
//! 线上格式：`{"type": "typing.start", "payload": {...}, "serverTimestamp": "..."}`。
//! `serverTimestamp` 只在服务端编码时打上，客户端带来的值一律忽略。

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Event;
use crate::value_objects::Timestamp;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode `{event_type}`: {message}")]
    Encoding { event_type: String, message: String },
    #[error("malformed frame: {message}")]
    Decoding { message: String },
}

impl CodecError {
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }
}

/// 通用信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<Timestamp>,
}

/// 编码一个服务端事件，时间戳在此刻打上。
pub fn encode(event: &Event) -> Result<String, CodecError> {
    encode_at(event, Utc::now())
}

pub fn encode_at(event: &Event, server_timestamp: Timestamp) -> Result<String, CodecError> {
    let encoding_error = |err: serde_json::Error| CodecError::Encoding {
        event_type: event.event_type().to_string(),
        message: err.to_string(),
    };

    let envelope = Envelope {
        event_type: event.event_type().to_string(),
        payload: event.payload_value().map_err(encoding_error)?,
        server_timestamp: Some(server_timestamp),
    };
    serde_json::to_string(&envelope).map_err(encoding_error)
}

/// 解码一帧为信封；只校验信封结构，不解释 payload。
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|err| CodecError::decoding(err.to_string()))?;
    if envelope.event_type.trim().is_empty() {
        return Err(CodecError::decoding("event type is empty"));
    }
    Ok(envelope)
}

pub(crate) fn payload<T: DeserializeOwned>(
    event_type: &str,
    payload: serde_json::Value,
) -> Result<T, CodecError> {
    serde_json::from_value(payload)
        .map_err(|err| CodecError::decoding(format!("invalid `{event_type}` payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_types, MessageStatusPayload, TypingPayload};
    use crate::message_status::MessageStatus;
    use crate::value_objects::{ConversationId, MessageId, UserId};

    #[test]
    fn encodes_self_describing_envelope() {
        let conversation_id = ConversationId::random();
        let user_id = UserId::random();
        let event = Event::typing(conversation_id, user_id, true);

        let json = encode(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "typing.start");
        assert_eq!(value["payload"]["conversationId"], conversation_id.to_string());
        assert_eq!(value["payload"]["userId"], user_id.to_string());
        assert_eq!(value["payload"]["isTyping"], true);
        assert!(value["serverTimestamp"].is_string());
    }

    #[test]
    fn server_timestamp_is_stamped_at_encode_time() {
        let event = Event::typing(ConversationId::random(), UserId::random(), false);
        let at = Utc::now() - chrono::Duration::minutes(5);

        let envelope = decode(encode_at(&event, at).unwrap().as_bytes()).unwrap();
        assert_eq!(envelope.server_timestamp, Some(at));
    }

    #[test]
    fn decoded_receipt_matches_original() {
        let event = Event::receipt(
            MessageId::random(),
            ConversationId::random(),
            UserId::random(),
            MessageStatus::Read,
            Utc::now(),
        )
        .unwrap();

        let envelope = decode(encode(&event).unwrap().as_bytes()).unwrap();
        assert_eq!(envelope.event_type, event_types::MESSAGE_READ);
        let receipt: MessageStatusPayload =
            payload(&envelope.event_type, envelope.payload).unwrap();
        assert_eq!(Event::MessageRead(receipt), event);
    }

    #[test]
    fn malformed_frames_are_decoding_errors() {
        assert!(matches!(decode(b"{not json"), Err(CodecError::Decoding { .. })));
        assert!(matches!(decode(br#"{"payload": {}}"#), Err(CodecError::Decoding { .. })));
        assert!(matches!(decode(br#"{"type": ""}"#), Err(CodecError::Decoding { .. })));
    }

    #[test]
    fn unknown_types_still_decode_to_an_envelope() {
        let envelope = decode(br#"{"type": "call.ring", "payload": {"x": 1}}"#).unwrap();
        assert_eq!(envelope.event_type, "call.ring");
        assert_eq!(envelope.payload["x"], 1);
    }

    #[test]
    fn known_type_with_wrong_payload_is_rejected() {
        let frame = br#"{"type": "typing.start", "payload": {"isTyping": "yes"}}"#;
        let envelope = decode(frame).unwrap();
        let err = payload::<TypingPayload>(&envelope.event_type, envelope.payload).unwrap_err();
        assert!(err.to_string().contains("typing.start"));

        let ok: Result<TypingPayload, _> = payload(
            event_types::TYPING_START,
            serde_json::json!({
                "conversationId": ConversationId::random(),
                "userId": UserId::random(),
                "isTyping": true
            }),
        );
        assert!(ok.is_ok());
    }
}
