//! Signaling relay server example
//!
//! Run with: cargo run --example relay_server [BIND_ADDR] [--trust]
//!
//! Examples:
//!   cargo run --example relay_server                    # binds to 0.0.0.0:8080
//!   cargo run --example relay_server localhost          # binds to 127.0.0.1:8080
//!   cargo run --example relay_server 127.0.0.1:9000     # binds to 127.0.0.1:9000
//!
//! ## Clustering
//!
//! Set `SIGNAL_RELAY_REDIS_URL=redis://127.0.0.1/` on every node to relay
//! call signaling between peers connected to different nodes. Without it
//! the server runs standalone.
//!
//! ## Authentication
//!
//! `--trust` accepts any `Authentication` message and binds the user id it
//! names. Only use it for local testing.

use std::net::SocketAddr;
use std::sync::Arc;

use signal_relay::api::{Authenticator, DenyAll};
use signal_relay::bus::{BusConfig, BusManager};
use signal_relay::codec::{DataError, SessionToken};
use signal_relay::session::Session;
use signal_relay::{RelayServer, ServerConfig};

/// Accepts every token at face value
struct TrustingAuthenticator;

impl Authenticator for TrustingAuthenticator {
    fn authenticate(&self, session: &Session, token: &SessionToken) -> Result<String, DataError> {
        if token.userid.is_empty() {
            return Err(DataError::new("authentication_failed", "missing user id"));
        }
        tracing::debug!(session_id = %session.id(), userid = %token.userid, "Trusting token");
        Ok(token.userid.clone())
    }

    fn decode_attestation(&self, _session: &Session, token: &str) -> Result<String, DataError> {
        // Attestations are plain session ids here
        Ok(token.to_string())
    }
}

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:8080
/// - "127.0.0.1" -> 127.0.0.1:8080
/// - "127.0.0.1:9000" -> 127.0.0.1:9000
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 8080;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: relay_server [BIND_ADDR] [--trust]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: SIGNAL_RELAY_BIND or 0.0.0.0:8080)");
    eprintln!("  --trust      Accept any authentication token");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    let trust = args.iter().any(|a| a == "--trust");

    let mut config = ServerConfig::from_env();
    if let Some(addr) = args.iter().find(|a| !a.starts_with("--")) {
        match parse_bind_addr(addr) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("signal_relay=debug".parse()?)
                .add_directive("relay_server=debug".parse()?),
        )
        .init();

    let authenticator: Arc<dyn Authenticator> = if trust {
        tracing::warn!("Accepting every authentication token");
        Arc::new(TrustingAuthenticator)
    } else {
        Arc::new(DenyAll)
    };

    let ws_path = config.ws_path.clone();
    let bus = BusManager::connect(BusConfig::from_env()).await;
    let server = RelayServer::new(config, bus, authenticator);

    println!("Signaling relay on ws://{}{}", server.bind_addr(), ws_path);
    println!("Stats at http://{}/stats", server.bind_addr());

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
