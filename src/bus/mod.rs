//! Distributed bus
//!
//! Carries triggers, cross-node room broadcasts, session lookups and the
//! sinks pipelines use to reach sessions on other nodes.

mod config;
mod local;
mod manager;
mod noop;
mod redis;
mod sink;
mod transport;
mod trigger;

pub use config::{BusConfig, DEFAULT_PREFIX};
pub use local::LocalBus;
pub use manager::{BusManager, BusRequest};
pub use noop::NoopBus;
pub use self::redis::RedisBus;
pub use sink::{BusSink, Sink};
pub use transport::{BusTransport, PayloadStream, Subscription};
pub use trigger::{
    trigger_subject, BusTrigger, TRIGGER_ANSWER, TRIGGER_BYE, TRIGGER_CONNECT,
    TRIGGER_DISCONNECT, TRIGGER_OFFER, TRIGGER_SESSION, TRIGGER_STARTUP,
};
