//! Bus manager
//!
//! Wraps a [`BusTransport`] with JSON payloads, request/reply, channel
//! binding, sinks and the trigger publisher.
//!
//! Triggers go through a bounded queue drained by a single publisher task,
//! so emitting one never waits on the backend. A full queue fails fast.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::BusConfig;
use super::local::LocalBus;
use super::noop::NoopBus;
use super::redis::RedisBus;
use super::sink::{BusSink, Sink};
use super::transport::{BusTransport, Subscription};
use super::trigger::{trigger_subject, BusTrigger, TRIGGER_STARTUP};
use crate::error::BusError;
use crate::session::random_id;

/// Request envelope carrying the subject to reply on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BusRequest<T> {
    pub reply: String,
    pub data: T,
}

struct TriggerEntry {
    subject: String,
    trigger: BusTrigger,
}

/// Entry point to the distributed bus
pub struct BusManager {
    config: BusConfig,
    transport: Arc<dyn BusTransport>,
    trigger_tx: mpsc::Sender<TriggerEntry>,
    trigger_rx: Mutex<Option<mpsc::Receiver<TriggerEntry>>>,
    publisher: Mutex<Option<JoinHandle<()>>>,
    me: std::sync::Weak<BusManager>,
}

impl BusManager {
    /// Create a manager over an explicit transport
    pub fn new(config: BusConfig, transport: Arc<dyn BusTransport>) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_queue_size.max(1));

        Arc::new_cyclic(|me| Self {
            config,
            transport,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            publisher: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Create a manager with the no-op transport
    pub fn noop(config: BusConfig) -> Arc<Self> {
        Self::new(config, Arc::new(NoopBus))
    }

    /// Create a manager sharing an in-process broker
    pub fn local(config: BusConfig, broker: LocalBus) -> Arc<Self> {
        Self::new(config, Arc::new(broker))
    }

    /// Connect the configured backend
    ///
    /// Never fails: without a redis URL, or when redis is unreachable, the
    /// no-op bus is used and relay stays on this node.
    pub async fn connect(config: BusConfig) -> Arc<Self> {
        let Some(url) = config.redis_url.clone() else {
            tracing::info!("No bus configured, relay limited to this node");
            return Self::noop(config);
        };

        match RedisBus::connect(&url).await {
            Ok(redis) => {
                tracing::info!(node = %config.node_id, "Redis bus connected");
                Self::new(config, Arc::new(redis))
            }
            Err(e) => {
                tracing::error!(error = %e, "Error connecting redis bus");
                Self::noop(config)
            }
        }
    }

    /// Bus configuration
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// This node's id
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Whether messages reach other nodes
    pub fn is_distributed(&self) -> bool {
        self.transport.is_distributed()
    }

    /// Start the trigger publisher and announce this node
    ///
    /// Calling it again has no effect.
    pub fn start(&self) {
        let Some(mut rx) = self
            .trigger_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let transport = Arc::clone(&self.transport);
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let payload = match serde_json::to_vec(&entry.trigger) {
                    Ok(payload) => Bytes::from(payload),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode trigger");
                        continue;
                    }
                };
                if let Err(e) = transport.publish(&entry.subject, payload).await {
                    tracing::warn!(subject = %entry.subject, error = %e, "Failed to publish trigger");
                }
            }
        });
        *self.publisher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            node = %self.config.node_id,
            transport = self.transport.name(),
            "Bus started"
        );

        if let Err(e) = self.trigger(TRIGGER_STARTUP, &self.config.node_id, "", None, None) {
            tracing::warn!(error = %e, "Failed to queue startup trigger");
        }
    }

    /// Stop the trigger publisher
    pub fn stop(&self) {
        if let Some(handle) = self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Prefix a subject with this bus's prefix
    pub fn prefix_subject(&self, subject: &str) -> String {
        format!("{}.{}", self.config.prefix, subject)
    }

    /// Publish `value` as JSON on `subject`
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(value)?;
        self.transport.publish(subject, Bytes::from(payload)).await
    }

    /// Publish `value` and wait for a single reply
    pub async fn request<T, R>(
        &self,
        subject: &str,
        value: &T,
        timeout: Duration,
    ) -> Result<R, BusError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if !self.is_distributed() {
            return Err(BusError::Disabled);
        }

        let reply = self.prefix_subject(&format!("reply.{}.{}", self.config.node_id, random_id(16)));
        let mut replies = self.transport.subscribe(&reply).await?;

        self.publish(subject, &BusRequest { reply, data: value }).await?;

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(payload)) => Ok(serde_json::from_slice(&payload)?),
            Ok(None) => Err(BusError::Backend("reply subscription ended".into())),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Queue a trigger for publishing on `<prefix>.<name>`
    ///
    /// Fails with [`BusError::QueueFull`] instead of waiting.
    pub fn trigger(
        &self,
        name: &str,
        from: &str,
        payload: &str,
        data: Option<Value>,
        pipeline: Option<&str>,
    ) -> Result<(), BusError> {
        if !self.is_distributed() {
            return Ok(());
        }

        let entry = TriggerEntry {
            subject: trigger_subject(&self.config.prefix, name),
            trigger: BusTrigger {
                id: self.config.node_id.clone(),
                name: name.to_string(),
                from: from.to_string(),
                payload: payload.to_string(),
                data,
                pipeline: pipeline.unwrap_or_default().to_string(),
            },
        };

        self.trigger_tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(trigger = name, "Failed to queue trigger, queue full");
                BusError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => BusError::Backend("trigger publisher stopped".into()),
        })
    }

    /// Call `handler` with every payload published on `subject`
    pub async fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let mut stream = self.transport.subscribe(subject).await?;
        let task = tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                handler(payload);
            }
        });
        Ok(Subscription::new(subject.to_string(), task))
    }

    /// Decode JSON published on `subject` into `channel`
    ///
    /// Ends when the receiving side of `channel` is dropped.
    pub async fn bind_recv_chan<T>(
        &self,
        subject: &str,
        channel: mpsc::Sender<T>,
    ) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut stream = self.transport.subscribe(subject).await?;
        let name = subject.to_string();
        let task = tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                let value = match serde_json::from_slice::<T>(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(subject = %name, error = %e, "Dropping undecodable bus message");
                        continue;
                    }
                };
                if channel.send(value).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(subject.to_string(), task))
    }

    /// Publish everything received on `channel` to `subject`
    ///
    /// Runs until every sender of `channel` is dropped.
    pub fn bind_send_chan<T>(&self, subject: &str, mut channel: mpsc::Receiver<T>) -> JoinHandle<()>
    where
        T: Serialize + Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        let subject = subject.to_string();
        tokio::spawn(async move {
            while let Some(value) = channel.recv().await {
                let payload = match serde_json::to_vec(&value) {
                    Ok(payload) => Bytes::from(payload),
                    Err(e) => {
                        tracing::error!(subject = %subject, error = %e, "Failed to encode bus message");
                        continue;
                    }
                };
                if let Err(e) = transport.publish(&subject, payload).await {
                    tracing::warn!(subject = %subject, error = %e, "Failed to publish");
                }
            }
        })
    }

    /// Sink for pipeline `id`: publishes on `.out`, receives on `.in`
    ///
    /// `None` when the bus does not leave this node.
    pub fn create_sink(&self, id: &str) -> Option<Arc<dyn Sink>> {
        self.sink(id, "out", "in")
    }

    /// The peer side of [`create_sink`](Self::create_sink), subjects swapped
    pub fn create_peer_sink(&self, id: &str) -> Option<Arc<dyn Sink>> {
        self.sink(id, "in", "out")
    }

    fn sink(&self, id: &str, out: &str, inbound: &str) -> Option<Arc<dyn Sink>> {
        if !self.is_distributed() {
            return None;
        }
        let me = self.me.upgrade()?;
        let sink = BusSink::new(
            me,
            id,
            self.prefix_subject(&format!("sink.{}.{}", id, out)),
            self.prefix_subject(&format!("sink.{}.{}", id, inbound)),
            self.config.sink_queue_size,
        );
        Some(Arc::new(sink))
    }
}

impl Drop for BusManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusManager")
            .field("node_id", &self.config.node_id)
            .field("transport", &self.transport.name())
            .finish()
    }
}
