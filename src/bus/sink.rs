//! Sinks bridge one pipeline to a remote peer
//!
//! A sink owns a pair of subjects. Entries written to it are published on
//! `subject_out`; whatever arrives on `subject_in` is pushed into the channel
//! given to [`Sink::bind_recv_chan`]. The peer side of the same pipeline uses
//! the swapped pair.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::manager::BusManager;
use super::transport::Subscription;
use crate::codec::{DataSink, RelayEntry};
use crate::error::BusError;

/// Bound subject pair attached to a pipeline
#[async_trait]
pub trait Sink: Send + Sync {
    /// Pipeline id this sink serves
    fn id(&self) -> &str;

    /// Send an entry to the peer; ignored once closed
    async fn write(&self, entry: &RelayEntry) -> Result<(), BusError>;

    /// Whether the sink still accepts writes
    fn enabled(&self) -> bool;

    /// Unsubscribe and disable; idempotent
    fn close(&self);

    /// Subject pair, as exported to the peer
    fn export(&self) -> DataSink;

    /// Deliver inbound entries to `channel`, replacing any previous binding
    async fn bind_recv_chan(&self, channel: mpsc::Sender<RelayEntry>) -> Result<(), BusError>;
}

struct SinkState {
    closed: bool,
    subscription: Option<Subscription>,
}

/// Sink over a [`BusManager`]
pub struct BusSink {
    id: String,
    subject_out: String,
    subject_in: String,
    bus: Arc<BusManager>,
    send_queue: mpsc::Sender<RelayEntry>,
    state: Mutex<SinkState>,
}

impl BusSink {
    pub(crate) fn new(
        bus: Arc<BusManager>,
        id: &str,
        subject_out: String,
        subject_in: String,
        queue_size: usize,
    ) -> Self {
        let (send_queue, rx) = mpsc::channel(queue_size);
        bus.bind_send_chan(&subject_out, rx);

        Self {
            id: id.to_string(),
            subject_out,
            subject_in,
            bus,
            send_queue,
            state: Mutex::new(SinkState {
                closed: false,
                subscription: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Sink for BusSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, entry: &RelayEntry) -> Result<(), BusError> {
        if !self.enabled() {
            return Ok(());
        }

        tracing::debug!(subject = %self.subject_out, pipeline = %self.id, "Sending via sink");
        self.send_queue
            .send(entry.clone())
            .await
            .map_err(|_| BusError::SinkClosed)
    }

    fn enabled(&self) -> bool {
        !self.lock().closed
    }

    fn close(&self) {
        let subscription = {
            let mut state = self.lock();
            state.closed = true;
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }

    fn export(&self) -> DataSink {
        DataSink {
            subject_out: self.subject_out.clone(),
            subject_in: self.subject_in.clone(),
        }
    }

    async fn bind_recv_chan(&self, channel: mpsc::Sender<RelayEntry>) -> Result<(), BusError> {
        if let Some(previous) = self.lock().subscription.take() {
            previous.unsubscribe();
        }

        let subscription = self.bus.bind_recv_chan(&self.subject_in, channel).await?;

        let mut state = self.lock();
        if state.closed {
            // Closed while subscribing
            return Err(BusError::SinkClosed);
        }
        state.subscription = Some(subscription);
        Ok(())
    }
}

impl std::fmt::Debug for BusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSink")
            .field("id", &self.id)
            .field("subject_out", &self.subject_out)
            .field("subject_in", &self.subject_in)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::{BusConfig, LocalBus};
    use crate::codec::DataOutgoing;

    fn entry(iid: &str) -> RelayEntry {
        RelayEntry {
            outgoing: DataOutgoing {
                iid: iid.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn bus(broker: &LocalBus) -> Arc<BusManager> {
        BusManager::new(
            BusConfig::default().prefix("test"),
            Arc::new(broker.clone()),
        )
    }

    #[tokio::test]
    async fn test_sink_and_peer_exchange() {
        let broker = LocalBus::new();
        let a = bus(&broker);
        let b = bus(&broker);

        let sink = a.create_sink("call.x.y").unwrap();
        let peer = b.create_peer_sink("call.x.y").unwrap();
        assert_eq!(sink.export().subject_out, "test.sink.call.x.y.out");
        assert_eq!(peer.export().subject_in, "test.sink.call.x.y.out");

        let (tx, mut rx) = mpsc::channel(8);
        peer.bind_recv_chan(tx).await.unwrap();
        sink.write(&entry("1")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.outgoing.iid, "1");
    }

    #[tokio::test]
    async fn test_closed_sink_ignores_writes() {
        let broker = LocalBus::new();
        let a = bus(&broker);
        let sink = a.create_sink("p").unwrap();
        let (tx, _rx) = mpsc::channel(8);
        sink.bind_recv_chan(tx).await.unwrap();

        sink.close();
        sink.close();
        tokio::task::yield_now().await;

        assert!(!sink.enabled());
        assert!(sink.write(&entry("x")).await.is_ok());
        assert_eq!(broker.subscriber_count("test.sink.p.in"), 0);
    }

    #[tokio::test]
    async fn test_rebind_replaces_subscription() {
        let broker = LocalBus::new();
        let a = bus(&broker);
        let sink = a.create_sink("p").unwrap();

        let (first, _first_rx) = mpsc::channel(8);
        let (second, _second_rx) = mpsc::channel(8);
        sink.bind_recv_chan(first).await.unwrap();
        sink.bind_recv_chan(second).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(broker.subscriber_count("test.sink.p.in"), 1);
    }
}
