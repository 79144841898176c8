//! Connection handler trait
//!
//! Implement [`ConnectionHandler`] to receive the lifecycle and text frames
//! of a [`Connection`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::buffer::PooledBuffer;
use crate::server::connection::Connection;

/// Callbacks driven by a connection's read pump
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Buffer to copy the next inbound frame into
    fn new_buffer(&self) -> PooledBuffer;

    /// Called once before the first frame is read
    async fn on_connect(&self, connection: Arc<Connection>);

    /// Called for every text frame; the buffer is released afterwards
    async fn on_text(&self, buffer: &PooledBuffer);

    /// Called once after the connection has been closed
    async fn on_disconnect(&self);
}
