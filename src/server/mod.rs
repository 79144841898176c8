//! WebSocket server
//!
//! [`RelayServer`] accepts WebSocket upgrades and runs one [`Connection`]
//! per socket, with a [`Client`] as its handler.

pub mod client;
pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod throttle;
pub mod transport;

pub use client::Client;
pub use config::{ConnectionConfig, ServerConfig};
pub use connection::Connection;
pub use handler::ConnectionHandler;
pub use listener::RelayServer;
pub use transport::{split_websocket, Frame, FrameSink, FrameStream};
