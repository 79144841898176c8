//! Bus transport capability
//!
//! A transport moves opaque payloads between subjects. The bus manager adds
//! JSON encoding, request/reply and channel binding on top.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::task::JoinHandle;

use crate::error::BusError;

/// Stream of payloads published on one subject
pub type PayloadStream = BoxStream<'static, Bytes>;

/// A publish/subscribe backend
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Whether messages leave this process
    ///
    /// The no-op backend returns `false`; relay then stays on one node.
    fn is_distributed(&self) -> bool {
        true
    }

    /// Publish a payload on `subject`
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Receive everything published on `subject` from now on
    ///
    /// The subscription is active once this returns; dropping the stream
    /// unsubscribes.
    async fn subscribe(&self, subject: &str) -> Result<PayloadStream, BusError>;
}

/// Handle to a task consuming a subject
///
/// Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(subject: String, task: JoinHandle<()>) -> Self {
        Self { subject, task }
    }

    /// Subscribed subject
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether the consuming task is still running
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop receiving
    pub fn unsubscribe(self) {
        tracing::debug!(subject = %self.subject, "Unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
