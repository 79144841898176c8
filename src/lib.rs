//! WebRTC signaling relay
//!
//! Browser clients connect over WebSocket and exchange JSON signaling
//! messages (offers, answers, ICE candidates, chat, room membership). When
//! two peers are connected to different relay nodes, call signaling travels
//! through a [`pipeline::Pipeline`] bridged over a pub/sub [`bus`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use signal_relay::api::DenyAll;
//! use signal_relay::bus::{BusConfig, BusManager};
//! use signal_relay::{RelayServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> signal_relay::Result<()> {
//!     let bus = BusManager::connect(BusConfig::from_env()).await;
//!     let server = RelayServer::new(ServerConfig::from_env(), bus, Arc::new(DenyAll));
//!     server.run().await
//! }
//! ```

pub mod api;
pub mod buffer;
pub mod bus;
pub mod codec;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use server::{ConnectionConfig, RelayServer, ServerConfig};
