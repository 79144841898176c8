//! In-process bus
//!
//! Clones share one broker, so several nodes running in the same process
//! can talk to each other as if over a real backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::transport::{BusTransport, PayloadStream};
use crate::error::BusError;

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>;

/// In-process publish/subscribe broker
#[derive(Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `subject`
    pub fn subscriber_count(&self, subject: &str) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers
            .get(subject)
            .map(|list| list.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusTransport for LocalBus {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(subject) {
            list.retain(|tx| tx.send(payload.clone()).is_ok());
            if list.is_empty() {
                subscribers.remove(subject);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<PayloadStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subject.to_string())
            .or_default()
            .push(tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subjects = self
            .subscribers
            .lock()
            .map(|s| s.len())
            .unwrap_or(0);
        f.debug_struct("LocalBus").field("subjects", &subjects).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_broker() {
        let publisher = LocalBus::new();
        let subscriber = publisher.clone();

        let mut stream = subscriber.subscribe("shared").await.unwrap();
        publisher
            .publish("shared", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = LocalBus::new();
        let stream = bus.subscribe("gone").await.unwrap();
        assert_eq!(bus.subscriber_count("gone"), 1);

        drop(stream);
        assert_eq!(bus.subscriber_count("gone"), 0);

        bus.publish("gone", Bytes::new()).await.unwrap();
        assert!(bus.subscribers.lock().unwrap().get("gone").is_none());
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("a").await.unwrap();
        let _b = bus.subscribe("b").await.unwrap();

        bus.publish("b", Bytes::from_static(b"for b")).await.unwrap();
        bus.publish("a", Bytes::from_static(b"for a")).await.unwrap();

        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"for a"));
    }
}
