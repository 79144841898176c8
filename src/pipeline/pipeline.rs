//! Relay pipelines
//!
//! A pipeline carries one signaling exchange between a local session and a
//! session that may live on another node. Entries that cannot be delivered
//! locally are logged and, once a sink is attached, written to it. The log
//! is replayed in order when the sink attaches, so nothing sent before the
//! remote side was found is lost.
//!
//! ```text
//!   Unresolved ──flush──► Resolving ──found──► Attached ──close/expire──► Closed
//!        ▲                    │
//!        └──── not found ─────┘
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::PipelineConfig;
use super::manager::PipelineManager;
use crate::bus::Sink;
use crate::codec::{DataIncoming, DataOutgoing, DataSession, RelayEntry};
use crate::error::PipelineError;
use crate::session::Session;

enum Resolution {
    Unresolved,
    /// Lookup in flight, with the sink listening for it once staged
    Resolving(Option<Arc<dyn Sink>>),
    Attached(Arc<dyn Sink>),
}

struct PipelineState {
    from: Option<Arc<Session>>,
    to: Option<Arc<Session>>,
    expires: Option<Instant>,
    data: Vec<RelayEntry>,
    resolution: Resolution,
}

impl PipelineState {
    fn attached(&self) -> Option<Arc<dyn Sink>> {
        match &self.resolution {
            Resolution::Attached(sink) if sink.enabled() => Some(Arc::clone(sink)),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FeedLine<'a> {
    seq: usize,
    msg: &'a DataOutgoing,
}

/// Time-bounded relay between two sessions
pub struct Pipeline {
    namespace: String,
    id: String,
    ttl: Duration,
    state: RwLock<PipelineState>,
    recv_tx: mpsc::Sender<RelayEntry>,
    shutdown: CancellationToken,
    manager: Weak<dyn PipelineManager>,
}

impl Pipeline {
    /// Create a pipeline and start draining its inbound queue
    pub fn new(
        manager: Weak<dyn PipelineManager>,
        namespace: &str,
        id: &str,
        from: Arc<Session>,
        config: &PipelineConfig,
    ) -> Arc<Self> {
        let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_size.max(1));

        let pipeline = Arc::new(Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            ttl: config.ttl,
            state: RwLock::new(PipelineState {
                from: Some(from),
                to: None,
                expires: Some(Instant::now() + config.ttl),
                data: Vec::new(),
                resolution: Resolution::Unresolved,
            }),
            recv_tx,
            shutdown: CancellationToken::new(),
            manager,
        });

        tokio::spawn(Self::receive(
            Arc::downgrade(&pipeline),
            recv_rx,
            pipeline.shutdown.clone(),
        ));

        tracing::debug!(pipeline = %id, "Pipeline created");
        pipeline
    }

    async fn receive(
        pipeline: Weak<Pipeline>,
        mut rx: mpsc::Receiver<RelayEntry>,
        shutdown: CancellationToken,
    ) {
        loop {
            let entry = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                entry = rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            let Some(pipeline) = pipeline.upgrade() else {
                break;
            };
            pipeline.dispatch(entry).await;
        }
        tracing::debug!("Pipeline receive done");
    }

    /// Hand a relayed entry to signaling as if sent by the `to` session
    async fn dispatch(&self, entry: RelayEntry) {
        let Some(api) = self.manager.upgrade().and_then(|m| m.channelling_api()) else {
            tracing::warn!(pipeline = %self.id, "No signaling api for relayed entry");
            return;
        };
        let Some(session) = self.sender_of(&entry).await else {
            tracing::warn!(pipeline = %self.id, "Relayed entry without sender");
            return;
        };

        let incoming = match DataIncoming::from_relayed(&entry.outgoing) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!(pipeline = %self.id, error = %e, "Dropping relayed entry");
                return;
            }
        };

        let result = api.on_incoming(None, &session, &incoming).await;
        if let Err(e) = &result {
            tracing::warn!(pipeline = %self.id, error = %e, "Pipeline receive incoming error");
        }
        api.on_incoming_processed(None, &session, &incoming, &result)
            .await;
    }

    /// The `to` session, or a mirror built from the entry when it arrives
    /// ahead of the lookup reply
    async fn sender_of(&self, entry: &RelayEntry) -> Option<Arc<Session>> {
        let mut state = self.state.write().await;
        if let Some(session) = &state.to {
            return Some(Arc::clone(session));
        }
        if entry.outgoing.from.is_empty() {
            return None;
        }

        let session = Arc::new(Session::remote(&DataSession {
            id: entry.outgoing.from.clone(),
            userid: entry.from_userid.clone(),
            ..Default::default()
        }));
        state.to = Some(Arc::clone(&session));
        Some(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn from_session(&self) -> Option<Arc<Session>> {
        self.state.read().await.from.clone()
    }

    pub async fn to_session(&self) -> Option<Arc<Session>> {
        self.state.read().await.to.clone()
    }

    /// Sender feeding the inbound queue
    pub(crate) fn recv_sender(&self) -> mpsc::Sender<RelayEntry> {
        self.recv_tx.clone()
    }

    /// Number of logged entries
    pub async fn len(&self) -> usize {
        self.state.read().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Extend the relay window from now
    pub async fn refresh(&self, ttl: Duration) {
        let mut state = self.state.write().await;
        if !self.is_closed() {
            state.expires = Some(Instant::now() + ttl);
        }
    }

    /// Log an entry and refresh the relay window
    pub async fn add(&self, mut entry: RelayEntry) -> Result<(), PipelineError> {
        let mut state = self.state.write().await;
        self.push(&mut state, &mut entry)
    }

    fn push(&self, state: &mut PipelineState, entry: &mut RelayEntry) -> Result<(), PipelineError> {
        if self.is_closed() {
            return Err(PipelineError::Closed(self.id.clone()));
        }
        entry.pipe = self.id.clone();
        state.data.push(entry.clone());
        state.expires = Some(Instant::now() + self.ttl);
        Ok(())
    }

    /// Attach a sink and replay the log into it
    ///
    /// Fails with [`PipelineError::AlreadyAttached`] while another enabled
    /// sink is attached; the caller should keep using that one.
    pub async fn attach(&self, sink: Arc<dyn Sink>) -> Result<(), PipelineError> {
        let mut state = self.state.write().await;
        if self.is_closed() {
            return Err(PipelineError::Closed(self.id.clone()));
        }
        if state.attached().is_some() {
            return Err(PipelineError::AlreadyAttached(self.id.clone()));
        }
        if let Resolution::Resolving(Some(pending)) =
            std::mem::replace(&mut state.resolution, Resolution::Unresolved)
        {
            pending.close();
        }

        self.attach_locked(&mut state, sink, None).await;
        Ok(())
    }

    async fn attach_locked(
        &self,
        state: &mut PipelineState,
        sink: Arc<dyn Sink>,
        to: Option<Arc<Session>>,
    ) {
        tracing::debug!(pipeline = %self.id, entries = state.data.len(), "Attach sink to pipeline");
        state.resolution = Resolution::Attached(Arc::clone(&sink));
        if to.is_some() {
            state.to = to;
        }

        for entry in &state.data {
            if let Err(e) = sink.write(entry).await {
                tracing::warn!(pipeline = %self.id, error = %e, "Failed to replay entry");
                break;
            }
        }
    }

    /// Take part in a lookup from the node holding `to`
    ///
    /// Keeps an attached sink. A sink still waiting on a lookup of our own
    /// is attached as is; otherwise `create` makes one, which listens
    /// before the log is replayed. Returns the sink to export.
    pub(crate) async fn accept<F>(&self, create: F, to: Option<Arc<Session>>) -> Option<Arc<dyn Sink>>
    where
        F: FnOnce() -> Option<Arc<dyn Sink>>,
    {
        let mut state = self.state.write().await;
        if self.is_closed() {
            return None;
        }
        if let Some(sink) = state.attached() {
            if to.is_some() {
                state.to = to;
            }
            return Some(sink);
        }

        let sink = match &state.resolution {
            Resolution::Resolving(Some(pending)) => Arc::clone(pending),
            _ => {
                let sink = create()?;
                if let Err(e) = sink.bind_recv_chan(self.recv_sender()).await {
                    tracing::warn!(pipeline = %self.id, error = %e, "Failed to bind sink receiver");
                    sink.close();
                    return None;
                }
                sink
            }
        };

        self.attach_locked(&mut state, Arc::clone(&sink), to).await;
        Some(sink)
    }

    /// Relay `outgoing` to `to` unless it is connected locally
    ///
    /// Resolves and attaches a sink on first use. The entry is logged even
    /// when no sink could be found, so a later attach replays it. Returns
    /// whether the entry was written to a sink.
    pub async fn flush_outgoing(&self, has_local: bool, to: &str, outgoing: &DataOutgoing) -> bool {
        if has_local {
            return false;
        }

        self.resolve(to).await;

        let mut state = self.state.write().await;
        let mut entry = RelayEntry {
            outgoing: outgoing.clone(),
            from_userid: state.from.as_ref().map(|s| s.userid()).unwrap_or_default(),
            to_userid: state.to.as_ref().map(|s| s.userid()).unwrap_or_default(),
            pipe: String::new(),
        };
        if let Err(e) = self.push(&mut state, &mut entry) {
            tracing::debug!(error = %e, "Flush on closed pipeline");
            return false;
        }

        let Some(sink) = state.attached() else {
            return false;
        };
        match sink.write(&entry).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pipeline = %self.id, error = %e, "Failed to write to sink");
                false
            }
        }
    }

    /// Listen on `sink` while a lookup for this pipeline is in flight
    ///
    /// Fails once a sink is attached, or when no lookup is pending.
    pub(crate) async fn listen(&self, sink: Arc<dyn Sink>) -> Result<(), PipelineError> {
        let mut state = self.state.write().await;
        if self.is_closed() {
            return Err(PipelineError::Closed(self.id.clone()));
        }
        if !matches!(state.resolution, Resolution::Resolving(None)) {
            return Err(PipelineError::AlreadyAttached(self.id.clone()));
        }

        sink.bind_recv_chan(self.recv_sender())
            .await
            .map_err(|_| PipelineError::Closed(self.id.clone()))?;
        state.resolution = Resolution::Resolving(Some(sink));
        Ok(())
    }

    /// Find and attach a sink for `to` unless one is attached or pending
    async fn resolve(&self, to: &str) {
        {
            let mut state = self.state.write().await;
            if self.is_closed() || state.attached().is_some() {
                return;
            }
            if matches!(state.resolution, Resolution::Resolving(_)) {
                // Entries logged meanwhile are replayed on attach
                return;
            }
            state.resolution = Resolution::Resolving(None);
        }

        let found = match self.manager.upgrade() {
            Some(manager) => manager.find_sink_and_session(self, to).await,
            None => None,
        };

        let mut state = self.state.write().await;
        let Some((sink, session)) = found else {
            if matches!(state.resolution, Resolution::Resolving(_)) {
                if let Resolution::Resolving(Some(pending)) =
                    std::mem::replace(&mut state.resolution, Resolution::Unresolved)
                {
                    pending.close();
                }
            }
            return;
        };

        let staged = matches!(&state.resolution, Resolution::Resolving(Some(p)) if Arc::ptr_eq(p, &sink));
        let unstaged = matches!(state.resolution, Resolution::Resolving(None));
        let adopted = matches!(&state.resolution, Resolution::Attached(p) if Arc::ptr_eq(p, &sink));

        if staged {
            self.attach_locked(&mut state, sink, Some(session)).await;
        } else if unstaged {
            self.attach_locked(&mut state, Arc::clone(&sink), Some(session)).await;
            if let Err(e) = sink.bind_recv_chan(self.recv_sender()).await {
                tracing::warn!(pipeline = %self.id, error = %e, "Failed to bind sink receiver");
            }
        } else if adopted {
            // Attached meanwhile by the other node's lookup
            state.to = Some(session);
        } else {
            tracing::debug!(pipeline = %self.id, "Discarding sink candidate");
            sink.close();
        }
    }

    /// Attached sink, while enabled
    pub async fn sink(&self) -> Option<Arc<dyn Sink>> {
        self.state.read().await.attached()
    }

    /// Close the pipeline; idempotent
    pub async fn close(&self) {
        let sink = {
            let mut state = self.state.write().await;
            if self.is_closed() {
                return;
            }
            self.shutdown.cancel();
            state.expires = None;
            match std::mem::replace(&mut state.resolution, Resolution::Unresolved) {
                Resolution::Attached(sink) => Some(sink),
                Resolution::Resolving(pending) => pending,
                Resolution::Unresolved => None,
            }
        };

        if let Some(sink) = sink {
            sink.close();
        }
        tracing::debug!(pipeline = %self.id, "Closed pipeline");
    }

    /// Whether the relay window has passed, or was cleared by close
    pub async fn expired(&self) -> bool {
        match self.state.read().await.expires {
            Some(expires) => expires <= Instant::now(),
            None => true,
        }
    }

    /// Log as newline-delimited `{"Seq":n,"Msg":{..}}` lines
    ///
    /// Starts at entry `since`; a `limit` of 0 means no limit.
    pub async fn json_feed(&self, since: usize, limit: usize) -> Result<Vec<u8>, serde_json::Error> {
        let state = self.state.read().await;
        let limit = if limit == 0 { usize::MAX } else { limit };

        let mut feed = Vec::new();
        for (seq, entry) in state.data.iter().enumerate().skip(since).take(limit) {
            serde_json::to_writer(
                &mut feed,
                &FeedLine {
                    seq,
                    msg: &entry.outgoing,
                },
            )?;
            feed.push(b'\n');
        }
        Ok(feed)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
