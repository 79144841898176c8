//! Per-connection duplex pumping
//!
//! Each connection runs two tasks. The read pump pulls frames off the
//! transport, rate limits text frames, and hands them to a
//! [`ConnectionHandler`]. The write pump drains a bounded FIFO queue onto the
//! transport and interleaves keepalive pings.
//!
//! ```text
//!   producers ──send()──► [queue ≤ queue_size*4] ──► write_pump ──► transport
//!                                                        ▲
//!                                          ping deadline ┘
//!
//!   transport ──► read_pump ──► throttle ──► handler.on_text()
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::buffer::Message;
use crate::error::{Error, Result};
use crate::server::config::ConnectionConfig;
use crate::server::handler::ConnectionHandler;
use crate::server::throttle::Throttle;
use crate::server::transport::Frame;

struct OutboundQueue {
    messages: VecDeque<Message>,
    closed: bool,
}

/// One client transport and its outbound queue
pub struct Connection {
    index: u64,
    config: ConnectionConfig,
    queue: Mutex<OutboundQueue>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a connection with the given process-unique index
    pub fn new(index: u64, config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            index,
            queue: Mutex::new(OutboundQueue {
                messages: VecDeque::with_capacity(config.queue_size),
                closed: false,
            }),
            config,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Connection index
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.lock_queue().closed
    }

    /// Number of messages waiting to be written
    pub fn queued(&self) -> usize {
        self.lock_queue().messages.len()
    }

    /// Take every queued message without writing it
    #[cfg(test)]
    pub(crate) fn take_queued(&self) -> Vec<Message> {
        self.lock_queue().messages.drain(..).collect()
    }

    fn lock_queue(&self) -> MutexGuard<'_, OutboundQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message for sending
    ///
    /// Never blocks. The message is dropped when the connection is closed or
    /// the queue is full; the oldest queued messages are kept.
    pub fn send(&self, message: &Message) {
        let mut queue = self.lock_queue();
        if queue.closed {
            tracing::debug!(connection = self.index, "Send on closed connection");
            return;
        }

        let max = self.config.max_queue_size();
        if queue.messages.len() >= max {
            tracing::warn!(
                connection = self.index,
                queued = queue.messages.len(),
                "Outbound queue overflow"
            );
            return;
        }

        queue.messages.push_back(message.clone());
        drop(queue);
        self.wake.notify_one();
    }

    /// Close the connection
    ///
    /// Idempotent. Stops both pumps and releases any queued messages.
    pub fn close(&self) {
        let drained = {
            let mut queue = self.lock_queue();
            if queue.closed {
                return;
            }
            queue.closed = true;
            std::mem::take(&mut queue.messages)
        };

        self.shutdown.cancel();
        self.wake.notify_one();

        tracing::debug!(
            connection = self.index,
            dropped = drained.len(),
            "Connection closed"
        );
    }

    /// Read frames until the transport ends, then close and disconnect
    pub async fn read_pump<H, R>(self: Arc<Self>, handler: Arc<H>, mut reader: R)
    where
        H: ConnectionHandler + ?Sized,
        R: Stream<Item = Result<Frame>> + Unpin,
    {
        handler.on_connect(Arc::clone(&self)).await;

        let mut throttle = Throttle::per_second(self.config.max_rate_per_second);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = timeout(self.config.pong_wait, reader.next()) => next,
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    tracing::warn!(connection = self.index, error = %e, "Error while reading");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::info!(connection = self.index, "Read deadline exceeded");
                    break;
                }
            };

            match frame {
                Frame::Text(data) => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = throttle.acquire() => {}
                    }

                    let mut buffer = handler.new_buffer();
                    buffer.extend_from_slice(&data);
                    handler.on_text(&buffer).await;
                }
                Frame::Close => break,
                // Any frame refreshes the read deadline
                Frame::Binary(_) | Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }

        self.close();
        handler.on_disconnect().await;
    }

    /// Write queued messages and keepalive pings until closed
    ///
    /// A failed or timed out write closes the connection.
    pub async fn write_pump<W>(self: Arc<Self>, mut writer: W) -> Result<()>
    where
        W: Sink<Frame, Error = Error> + Unpin,
    {
        let mut next_ping = Instant::now() + self.config.ping_period;

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = self.wake.notified() => {}
                _ = sleep_until(next_ping) => {}
            }

            if let Err(e) = self.flush(&mut writer, &mut next_ping).await {
                break Err(e);
            }
        };

        if let Err(ref e) = result {
            tracing::warn!(connection = self.index, error = %e, "Error while writing");
        }

        self.close();
        let _ = writer.close().await;
        result
    }

    /// Drain the whole queue, sending a due ping between items
    async fn flush<W>(&self, writer: &mut W, next_ping: &mut Instant) -> Result<()>
    where
        W: Sink<Frame, Error = Error> + Unpin,
    {
        loop {
            if Instant::now() >= *next_ping {
                self.write(writer, Frame::Ping(Bytes::new())).await?;
                *next_ping = Instant::now() + self.config.ping_period;
            }

            let message = {
                let mut queue = self.lock_queue();
                if queue.closed {
                    return Ok(());
                }
                queue.messages.pop_front()
            };

            match message {
                Some(message) => self.write(writer, Frame::from(&message)).await?,
                None => return Ok(()),
            }
        }
    }

    async fn write<W>(&self, writer: &mut W, frame: Frame) -> Result<()>
    where
        W: Sink<Frame, Error = Error> + Unpin,
    {
        match timeout(self.config.write_wait, writer.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(Error::WriteTimeout(self.config.write_wait)),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("closed", &self.is_closed())
            .finish()
    }
}
