//! Pipeline manager
//!
//! Owns the pipelines of this node, keyed by a deterministic id derived
//! from the namespace and the two session ids, and resolves remote
//! sessions through the bus.
//!
//! Resolution is a request on `<prefix>.session.find`. Sink direction is
//! fixed by the session pair: the node holding the session whose id sorts
//! first publishes on `.out`, the other on `.in`. The requester listens
//! before asking, and the node holding the target attaches its sink and
//! replays its log before replying, so no entry is written before the
//! other side listens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::config::PipelineConfig;
use super::pipeline::Pipeline;
use crate::api::ChannellingApi;
use crate::bus::{BusManager, BusRequest, Sink, Subscription};
use crate::codec::{DataSession, DataSink};
use crate::error::BusError;
use crate::session::{Hub, Session};

/// Namespace of call signaling pipelines
pub const PIPELINE_NAMESPACE_CALL: &str = "call";

const SESSION_FIND_SUBJECT: &str = "session.find";

/// Pipeline id for a session pair; the same from either side
pub fn pipeline_id(namespace: &str, a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{}.{}.{}", namespace, first, second)
}

/// What pipelines need from their owner
#[async_trait]
pub trait PipelineManager: Send + Sync {
    /// Live pipeline between `session` and `to`, created if needed
    async fn get_pipeline(&self, namespace: &str, session: &Arc<Session>, to: &str)
        -> Arc<Pipeline>;

    /// Sink reaching `to` on another node, and a mirror of that session
    async fn find_sink_and_session(
        &self,
        pipeline: &Pipeline,
        to: &str,
    ) -> Option<(Arc<dyn Sink>, Arc<Session>)>;

    /// Dispatcher for entries relayed in from other nodes
    fn channelling_api(&self) -> Option<Arc<dyn ChannellingApi>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FindSession {
    id: String,
    namespace: String,
    to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<DataSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FindSessionReply {
    session: DataSession,
    sink: DataSink,
}

/// Pipelines of this node
pub struct Pipelines {
    config: PipelineConfig,
    bus: Arc<BusManager>,
    hub: Arc<Hub>,
    api: StdRwLock<Option<Weak<dyn ChannellingApi>>>,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
    finder: Mutex<Option<Subscription>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    me: Weak<Pipelines>,
}

impl Pipelines {
    pub fn new(config: PipelineConfig, bus: Arc<BusManager>, hub: Arc<Hub>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            bus,
            hub,
            api: StdRwLock::new(None),
            pipelines: RwLock::new(HashMap::new()),
            finder: Mutex::new(None),
            cleanup: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Set the dispatcher for relayed entries; held weakly
    pub fn set_channelling_api(&self, api: &Arc<dyn ChannellingApi>) {
        *self.api.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(api));
    }

    /// Answer session lookups and start reaping expired pipelines
    pub async fn start(&self) -> Result<(), BusError> {
        if self.bus.is_distributed() {
            let me = self.me.clone();
            let subject = self.bus.prefix_subject(SESSION_FIND_SUBJECT);
            let subscription = self
                .bus
                .subscribe(&subject, move |payload| {
                    let Some(pipelines) = me.upgrade() else {
                        return;
                    };
                    match serde_json::from_slice::<BusRequest<FindSession>>(&payload) {
                        Ok(request) => {
                            tokio::spawn(async move { pipelines.answer_find(request).await });
                        }
                        Err(e) => tracing::warn!(error = %e, "Invalid session find request"),
                    }
                })
                .await?;
            *self.finder.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        }

        let me = self.me.clone();
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pipelines) = me.upgrade() else {
                    break;
                };
                let reaped = pipelines.cleanup().await;
                if reaped > 0 {
                    tracing::debug!(reaped = reaped, "Reaped expired pipelines");
                }
            }
        });
        *self.cleanup.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(subscription) = self.finder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            subscription.unsubscribe();
        }
        if let Some(handle) = self.cleanup.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    /// Live pipeline by id
    pub async fn get(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .read()
            .await
            .get(id)
            .filter(|p| !p.is_closed())
            .cloned()
    }

    /// Number of tracked pipelines
    pub async fn len(&self) -> usize {
        self.pipelines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn get_or_create(&self, namespace: &str, id: &str, from: &Arc<Session>) -> Arc<Pipeline> {
        let mut pipelines = self.pipelines.write().await;
        if let Some(pipeline) = pipelines.get(id) {
            if !pipeline.is_closed() {
                return Arc::clone(pipeline);
            }
        }

        let manager: Weak<dyn PipelineManager> = self.me.clone();
        let pipeline = Pipeline::new(manager, namespace, id, Arc::clone(from), &self.config);
        pipelines.insert(id.to_string(), Arc::clone(&pipeline));
        pipeline
    }

    /// Close and forget expired pipelines
    pub async fn cleanup(&self) -> usize {
        let candidates: Vec<(String, Arc<Pipeline>)> = self
            .pipelines
            .read()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), Arc::clone(p)))
            .collect();

        let mut reaped = 0;
        for (id, pipeline) in candidates {
            if !pipeline.expired().await {
                continue;
            }
            pipeline.close().await;

            let mut pipelines = self.pipelines.write().await;
            if pipelines.get(&id).is_some_and(|p| Arc::ptr_eq(p, &pipeline)) {
                pipelines.remove(&id);
                reaped += 1;
            }
        }
        reaped
    }

    /// Sink for pipeline `id` as seen from the `local` session
    ///
    /// The side whose session id sorts first publishes on `.out`.
    fn sink_for(&self, id: &str, local: &str, remote: &str) -> Option<Arc<dyn Sink>> {
        if local <= remote {
            self.bus.create_sink(id)
        } else {
            self.bus.create_peer_sink(id)
        }
    }

    /// Claim a lookup if the target session is connected here
    async fn answer_find(&self, request: BusRequest<FindSession>) {
        let find = request.data;
        let Some(target) = self.hub.get_session(&find.to).await else {
            return;
        };
        let Some(from) = find.from.as_ref() else {
            tracing::debug!(pipeline = %find.id, "Session find without requester");
            return;
        };

        let pipeline = self.get_or_create(&find.namespace, &find.id, &target).await;
        let remote = Arc::new(Session::remote(from));
        let create = || self.sink_for(&find.id, target.id(), &from.id);
        let Some(sink) = pipeline.accept(create, Some(remote)).await else {
            tracing::debug!(pipeline = %find.id, "Not answering session find");
            return;
        };

        let reply = FindSessionReply {
            session: target.data(),
            sink: sink.export(),
        };
        if let Err(e) = self.bus.publish(&request.reply, &reply).await {
            tracing::warn!(pipeline = %find.id, error = %e, "Failed to answer session find");
        }
    }
}

#[async_trait]
impl PipelineManager for Pipelines {
    async fn get_pipeline(&self, namespace: &str, session: &Arc<Session>, to: &str) -> Arc<Pipeline> {
        let id = pipeline_id(namespace, session.id(), to);
        self.get_or_create(namespace, &id, session).await
    }

    async fn find_sink_and_session(
        &self,
        pipeline: &Pipeline,
        to: &str,
    ) -> Option<(Arc<dyn Sink>, Arc<Session>)> {
        if !self.bus.is_distributed() {
            return None;
        }

        let local = pipeline.from_session().await?;
        let sink = self.sink_for(pipeline.id(), local.id(), to)?;
        // Listen before asking; the answering node replays its log first
        if let Err(e) = pipeline.listen(Arc::clone(&sink)).await {
            tracing::debug!(pipeline = %pipeline.id(), error = %e, "Not looking up session");
            sink.close();
            return None;
        }

        let find = FindSession {
            id: pipeline.id().to_string(),
            namespace: pipeline.namespace().to_string(),
            to: to.to_string(),
            from: Some(local.data()),
        };
        let subject = self.bus.prefix_subject(SESSION_FIND_SUBJECT);
        let reply: FindSessionReply = match self
            .bus
            .request(&subject, &find, self.config.lookup_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(to = %to, error = %e, "Session not found on any node");
                return None;
            }
        };

        tracing::debug!(
            pipeline = %pipeline.id(),
            to = %to,
            subject = %reply.sink.subject_in,
            "Session found on another node"
        );
        Some((sink, Arc::new(Session::remote(&reply.session))))
    }

    fn channelling_api(&self) -> Option<Arc<dyn ChannellingApi>> {
        self.api
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::{BusConfig, LocalBus};
    use crate::codec::Codec;
    use crate::stats::StatsCounter;

    fn node(broker: &LocalBus, name: &str) -> (Arc<Hub>, Arc<Pipelines>) {
        let bus = BusManager::local(BusConfig::default().node_id(name).prefix("t"), broker.clone());
        let hub = Hub::new(Codec::default(), Arc::clone(&bus), Arc::new(StatsCounter::new()));
        let pipelines = Pipelines::new(PipelineConfig::default(), bus, Arc::clone(&hub));
        (hub, pipelines)
    }

    #[test]
    fn test_pipeline_id_is_symmetric() {
        assert_eq!(pipeline_id("call", "b", "a"), "call.a.b");
        assert_eq!(pipeline_id("call", "a", "b"), "call.a.b");
    }

    #[tokio::test]
    async fn test_sink_direction_follows_session_order() {
        let broker = LocalBus::new();
        let (_hub_a, node_a) = node(&broker, "a");
        let (_hub_b, node_b) = node(&broker, "b");

        // Whichever node looks up first, each side picks the same direction
        let first = node_a.sink_for("call.alice.bob", "alice", "bob").unwrap().export();
        let second = node_b.sink_for("call.alice.bob", "bob", "alice").unwrap().export();

        assert_eq!(first.subject_out, "t.sink.call.alice.bob.out");
        assert_eq!(first.subject_out, second.subject_in);
        assert_eq!(first.subject_in, second.subject_out);
    }

    #[tokio::test]
    async fn test_get_pipeline_reuses_live_and_replaces_closed() {
        let (_hub, pipelines) = node(&LocalBus::new(), "a");
        let alice = Arc::new(Session::new("alice", "s"));

        let first = pipelines.get_pipeline("call", &alice, "bob").await;
        let again = pipelines.get_pipeline("call", &alice, "bob").await;
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.id(), "call.alice.bob");

        first.close().await;
        let fresh = pipelines.get_pipeline("call", &alice, "bob").await;
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_reaps_expired() {
        let (_hub, pipelines) = node(&LocalBus::new(), "a");
        let alice = Arc::new(Session::new("alice", "s"));

        let stale = pipelines.get_pipeline("call", &alice, "bob").await;
        tokio::time::advance(Duration::from_secs(20)).await;
        let fresh = pipelines.get_pipeline("call", &alice, "carol").await;
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(pipelines.cleanup().await, 1);
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());
        assert_eq!(pipelines.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_times_out_when_nobody_has_session() {
        let broker = LocalBus::new();
        let (_hub, pipelines) = node(&broker, "a");
        pipelines.start().await.unwrap();
        let alice = Arc::new(Session::new("alice", "s"));

        let pipeline = pipelines.get_pipeline("call", &alice, "ghost").await;
        assert!(!pipeline.flush_outgoing(false, "ghost", &Default::default()).await);
        assert!(pipeline.sink().await.is_none());
        assert_eq!(pipeline.len().await, 1);

        // Not stuck resolving; the next flush looks up again
        assert!(!pipeline.flush_outgoing(false, "ghost", &Default::default()).await);
        assert_eq!(pipeline.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_waits_for_configured_timeout() {
        let bus = BusManager::local(BusConfig::default().prefix("t"), LocalBus::new());
        let hub = Hub::new(Codec::default(), Arc::clone(&bus), Arc::new(StatsCounter::new()));
        let config = PipelineConfig::default().lookup_timeout(Duration::from_millis(300));
        let pipelines = Pipelines::new(config, bus, hub);
        let alice = Arc::new(Session::new("alice", "s"));

        let pipeline = pipelines.get_pipeline("call", &alice, "ghost").await;
        let start = tokio::time::Instant::now();
        assert!(!pipeline.flush_outgoing(false, "ghost", &Default::default()).await);

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_find_on_noop_bus() {
        let bus = BusManager::noop(BusConfig::default());
        let hub = Hub::new(Codec::default(), Arc::clone(&bus), Arc::new(StatsCounter::new()));
        let pipelines = Pipelines::new(PipelineConfig::default(), bus, hub);
        let alice = Arc::new(Session::new("alice", "s"));

        let pipeline = pipelines.get_pipeline("call", &alice, "bob").await;
        assert!(pipelines.sink_for(pipeline.id(), "alice", "bob").is_none());
        assert!(pipelines.find_sink_and_session(&pipeline, "bob").await.is_none());
        assert!(!pipeline.flush_outgoing(false, "bob", &Default::default()).await);
    }
}
