//! Frame transport
//!
//! A connection talks to its peer through a stream of inbound [`Frame`]s and
//! a sink of outbound ones. [`split_websocket`] adapts an axum WebSocket to
//! that shape; tests plug in channels instead.

use std::pin::Pin;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};

use crate::buffer::{FrameKind, Message};
use crate::error::{Error, Result};

/// A single transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl From<&Message> for Frame {
    fn from(message: &Message) -> Self {
        let payload = Bytes::copy_from_slice(message.as_bytes());
        match message.kind() {
            FrameKind::Text => Frame::Text(payload),
            FrameKind::Binary => Frame::Binary(payload),
        }
    }
}

impl From<WsMessage> for Frame {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Text(text) => Frame::Text(Bytes::from(text)),
            WsMessage::Binary(data) => Frame::Binary(Bytes::from(data)),
            WsMessage::Ping(data) => Frame::Ping(Bytes::from(data)),
            WsMessage::Pong(data) => Frame::Pong(Bytes::from(data)),
            WsMessage::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            // Takes over the frame's allocation when it is the only owner
            Frame::Text(data) => match String::from_utf8(Vec::from(data)) {
                Ok(text) => WsMessage::Text(text),
                Err(e) => WsMessage::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
            Frame::Binary(data) => WsMessage::Binary(Vec::from(data)),
            Frame::Ping(data) => WsMessage::Ping(Vec::from(data)),
            Frame::Pong(data) => WsMessage::Pong(Vec::from(data)),
            Frame::Close => WsMessage::Close(None),
        }
    }
}

/// Inbound half of a transport
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Outbound half of a transport
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;

/// Split an upgraded WebSocket into frame halves
pub fn split_websocket(socket: WebSocket) -> (FrameStream, FrameSink) {
    let (ws_tx, ws_rx) = socket.split();

    let reader = ws_rx.map(|message| message.map(Frame::from).map_err(Error::transport));
    let writer = ws_tx
        .sink_map_err(Error::transport)
        .with(|frame: Frame| future::ready(Ok::<_, Error>(WsMessage::from(frame))));

    (Box::pin(reader), Box::pin(writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    #[test]
    fn test_frame_from_message() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"{\"Type\":\"Self\"}");

        let frame = Frame::from(&Message::text(buf));
        assert_eq!(frame, Frame::Text(Bytes::from_static(b"{\"Type\":\"Self\"}")));
    }

    #[test]
    fn test_ws_conversion() {
        assert_eq!(
            Frame::from(WsMessage::Text("hi".into())),
            Frame::Text(Bytes::from_static(b"hi"))
        );
        assert_eq!(Frame::from(WsMessage::Close(None)), Frame::Close);
        assert!(matches!(
            WsMessage::from(Frame::Ping(Bytes::new())),
            WsMessage::Ping(data) if data.is_empty()
        ));
    }

    #[test]
    fn test_text_frame_reuses_payload() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"{\"Type\":\"Bye\"}");

        let frame = Frame::from(&Message::text(buf));
        let Frame::Text(payload) = &frame else {
            panic!("expected text frame");
        };
        let ptr = payload.as_ptr();

        let WsMessage::Text(text) = WsMessage::from(frame) else {
            panic!("expected text message");
        };
        assert_eq!(text, "{\"Type\":\"Bye\"}");
        assert_eq!(text.as_ptr(), ptr);
    }

    #[test]
    fn test_invalid_utf8_text_is_replaced() {
        let frame = Frame::Text(Bytes::from_static(b"ok\xff"));
        let WsMessage::Text(text) = WsMessage::from(frame) else {
            panic!("expected text message");
        };
        assert_eq!(text, "ok\u{fffd}");
    }
}
