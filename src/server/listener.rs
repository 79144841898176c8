//! Relay server
//!
//! Wires the bus, hub, pipelines and dispatcher together and serves the
//! WebSocket upgrade endpoint. Every accepted socket becomes a [`Client`]
//! pumped by a [`Connection`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Sink, Stream};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::api::{Authenticator, ChannellingApi, SignalingApi};
use crate::bus::BusManager;
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::pipeline::{PipelineConfig, Pipelines};
use crate::server::client::Client;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::transport::{split_websocket, Frame};
use crate::session::Hub;
use crate::stats::StatsCounter;

/// Previous ids presented by a reconnecting client
#[derive(Debug, Default, Deserialize)]
struct ReconnectQuery {
    id: Option<String>,
    sid: Option<String>,
}

struct RelayState {
    config: ServerConfig,
    hub: Arc<Hub>,
    api: Arc<dyn ChannellingApi>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

/// Signaling relay server
pub struct RelayServer {
    state: Arc<RelayState>,
    bus: Arc<BusManager>,
    pipelines: Arc<Pipelines>,
}

impl RelayServer {
    /// Create a server on `bus` with default pipeline settings
    pub fn new(config: ServerConfig, bus: Arc<BusManager>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self::with_pipeline_config(config, bus, authenticator, PipelineConfig::default())
    }

    /// Create a server with custom pipeline configuration
    pub fn with_pipeline_config(
        config: ServerConfig,
        bus: Arc<BusManager>,
        authenticator: Arc<dyn Authenticator>,
        pipeline_config: PipelineConfig,
    ) -> Self {
        let codec = Codec::new(config.connection.max_message_size);
        let hub = Hub::new(codec, Arc::clone(&bus), Arc::new(StatsCounter::new()));
        let pipelines = Pipelines::new(pipeline_config, Arc::clone(&bus), Arc::clone(&hub));

        let api: Arc<dyn ChannellingApi> = SignalingApi::new(
            config.version.clone(),
            Arc::clone(&hub),
            Arc::clone(&pipelines),
            authenticator,
        );
        pipelines.set_channelling_api(&api);

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            state: Arc::new(RelayState {
                config,
                hub,
                api,
                connection_semaphore,
            }),
            bus,
            pipelines,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    pub fn bus(&self) -> &Arc<BusManager> {
        &self.bus
    }

    pub fn pipelines(&self) -> &Arc<Pipelines> {
        &self.pipelines
    }

    /// Start the bus publisher and the hub and pipeline subscriptions
    pub async fn start(&self) -> Result<()> {
        self.bus.start();
        self.state.hub.start().await?;
        self.pipelines.start().await?;
        Ok(())
    }

    pub fn stop(&self) {
        self.pipelines.stop();
        self.state.hub.stop();
        self.bus.stop();
    }

    /// HTTP routes: the WebSocket endpoint and a stats snapshot
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.config.ws_path, get(ws_upgrade))
            .route("/stats", get(stats))
            .with_state(Arc::clone(&self.state))
    }

    /// Serve one client over an already established transport
    ///
    /// Returns once the connection has closed.
    pub async fn serve_transport<R, W>(&self, reader: R, writer: W)
    where
        R: Stream<Item = Result<Frame>> + Unpin + Send + 'static,
        W: Sink<Frame, Error = Error> + Unpin + Send + 'static,
    {
        serve(Arc::clone(&self.state), reader, writer, None, None).await;
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        self.start().await?;
        tracing::info!(
            addr = %self.state.config.bind_addr,
            path = %self.state.config.ws_path,
            node = %self.bus.node_id(),
            "Relay server listening"
        );

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Shutdown signal received");
            })
            .await;

        self.stop();
        result.map_err(Error::from)
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.state.config.bind_addr
    }
}

async fn ws_upgrade(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<ReconnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Check connection limit
    let permit = if let Some(ref sem) = state.connection_semaphore {
        match Arc::clone(sem).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                tracing::warn!("Connection rejected: limit reached");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    } else {
        None
    };

    let reconnect = match (query.id, query.sid) {
        (Some(id), Some(sid)) if !id.is_empty() && !sid.is_empty() => Some((id, sid)),
        _ => None,
    };

    ws.max_message_size(state.config.connection.max_message_size)
        .on_upgrade(move |socket| async move {
            let (reader, writer) = split_websocket(socket);
            serve(state, reader, writer, reconnect, permit).await;
        })
}

async fn stats(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(state.hub.stat().await)
}

async fn serve<R, W>(
    state: Arc<RelayState>,
    reader: R,
    writer: W,
    reconnect: Option<(String, String)>,
    _permit: Option<OwnedSemaphorePermit>,
) where
    R: Stream<Item = Result<Frame>> + Unpin + Send + 'static,
    W: Sink<Frame, Error = Error> + Unpin + Send + 'static,
{
    let hub = &state.hub;
    let index = hub.stats_counter().next_connection();
    let session = hub
        .create_session(reconnect.as_ref().map(|(id, sid)| (id.as_str(), sid.as_str())))
        .await;

    tracing::debug!(connection = index, session_id = %session.id(), "New connection");

    let client = Client::new(session, hub.codec().clone(), Arc::clone(&state.api));
    let connection = Connection::new(index, state.config.connection.clone());

    let write_pump = tokio::spawn(Arc::clone(&connection).write_pump(writer));
    Arc::clone(&connection).read_pump(client, reader).await;

    if let Ok(Err(e)) = write_pump.await {
        tracing::debug!(connection = index, error = %e, "Connection error");
    }
    tracing::debug!(connection = index, "Connection closed");
}

#[cfg(test)]
mod tests {
    use futures_util::SinkExt;
    use tokio::sync::mpsc;
    use tokio_util::sync::PollSender;

    use super::*;
    use crate::api::DenyAll;
    use crate::bus::BusConfig;

    fn server(config: ServerConfig) -> RelayServer {
        RelayServer::new(config, BusManager::noop(BusConfig::default()), Arc::new(DenyAll))
    }

    #[tokio::test]
    async fn test_serve_transport_sends_self_and_disconnects() {
        let server = server(ServerConfig::default());
        server.start().await.unwrap();

        let (in_tx, mut in_rx) = mpsc::channel::<Result<Frame>>(8);
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(8);
        let reader = futures_util::stream::poll_fn(move |cx| in_rx.poll_recv(cx));
        let writer = PollSender::new(out_tx).sink_map_err(Error::transport);

        let hub = Arc::clone(server.hub());
        let serving = tokio::spawn(async move { server.serve_transport(reader, writer).await });

        let Frame::Text(data) = out_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let hello: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(hello["Data"]["Type"], "Self");
        assert_eq!(hub.stat().await.sessions, 1);

        in_tx.send(Ok(Frame::Close)).await.unwrap();
        serving.await.unwrap();
        assert_eq!(hub.stat().await.sessions, 0);
        assert_eq!(hub.stat().await.count, 1);
    }

    #[tokio::test]
    async fn test_router_builds_with_limit() {
        let server = server(ServerConfig::default().max_connections(1).ws_path("/signaling"));

        assert!(server.state.connection_semaphore.is_some());
        let _router = server.router();
    }
}
