//! axum WebSocket 与传输无关的 [`Frame`] 之间的适配
//!
//! 升级完成后把 socket 拆成读写两半，包装成 `Sink<Frame>` / `Stream<Frame>`
//! 交给 [`Realtime::serve`]，连接的其余生命周期都在应用层完成。

use std::sync::Arc;

use application::{CloseFrame, Frame, Identity, Realtime};
use axum::extract::ws::{self, Message as WsMessage, WebSocket};
use futures_util::{future, SinkExt, StreamExt};

fn to_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        Frame::Ping(data) => WsMessage::Ping(data.into()),
        Frame::Pong(data) => WsMessage::Pong(data.into()),
        Frame::Close(close) => WsMessage::Close(close.map(|close| ws::CloseFrame {
            code: close.code,
            reason: close.reason.into(),
        })),
    }
}

fn from_ws(message: WsMessage) -> Frame {
    match message {
        WsMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
        WsMessage::Binary(bytes) => Frame::Binary(bytes.to_vec()),
        WsMessage::Ping(data) => Frame::Ping(data.to_vec()),
        WsMessage::Pong(data) => Frame::Pong(data.to_vec()),
        WsMessage::Close(close) => Frame::Close(close.map(|close| CloseFrame {
            code: close.code,
            reason: close.reason.as_str().to_owned(),
        })),
    }
}

/// 驱动一条已升级的 WebSocket 连接直到结束
pub async fn serve_socket(socket: WebSocket, realtime: Arc<Realtime>, identity: Identity) {
    let user_id = identity.user_id;
    let (sender, receiver) = socket.split();
    let sink = sender.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_ws(frame))));
    let stream = receiver.map(|message| message.map(from_ws));

    match realtime.serve(identity, sink, stream).await {
        Ok(reason) => {
            tracing::debug!(user_id = %user_id, reason = %reason, "WebSocket 连接已关闭");
        }
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "WebSocket 连接注册失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frames_survive_conversion() {
        let frame = Frame::Close(Some(CloseFrame {
            code: 1008,
            reason: "slow consumer".into(),
        }));
        assert_eq!(from_ws(to_ws(frame.clone())), frame);
        assert_eq!(from_ws(to_ws(Frame::Close(None))), Frame::Close(None));
    }

    #[test]
    fn text_frames_keep_payload() {
        let frame = Frame::Text(r#"{"type":"typing.start"}"#.into());
        assert_eq!(from_ws(to_ws(frame.clone())), frame);
    }
}
