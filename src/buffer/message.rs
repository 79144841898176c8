//! Outbound message type

use std::sync::Arc;

use super::pool::PooledBuffer;

/// Kind of frame a message is sent as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 text frame
    Text,
    /// Binary frame
    Binary,
}

/// An immutable message ready to be queued on one or more connections
///
/// Cloning only increments the reference count of the shared buffer.
#[derive(Debug, Clone)]
pub struct Message {
    buffer: Arc<PooledBuffer>,
    kind: FrameKind,
}

impl Message {
    /// Wrap a filled buffer as a text message
    pub fn text(buffer: PooledBuffer) -> Self {
        Self {
            buffer: Arc::new(buffer),
            kind: FrameKind::Text,
        }
    }

    /// Wrap a filled buffer as a binary message
    pub fn binary(buffer: PooledBuffer) -> Self {
        Self {
            buffer: Arc::new(buffer),
            kind: FrameKind::Binary,
        }
    }

    /// Frame kind
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of live references to the underlying buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    #[test]
    fn test_message_shares_buffer() {
        let pool = BufferPool::with_capacity(4, 64);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"{}");

        let msg = Message::text(buf);
        assert_eq!(msg.kind(), FrameKind::Text);
        assert_eq!(msg.ref_count(), 1);

        let queued = msg.clone();
        assert_eq!(msg.ref_count(), 2);
        assert_eq!(queued.as_bytes(), b"{}");

        drop(msg);
        assert_eq!(pool.available(), 0);
        drop(queued);
        assert_eq!(pool.available(), 1);
    }
}
