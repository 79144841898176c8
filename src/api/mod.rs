//! Signaling API
//!
//! [`ChannellingApi`] is the seam between transport-facing code (clients and
//! pipelines) and signaling semantics. [`SignalingApi`] is the built-in
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::codec::{DataError, DataIncoming};
use crate::server::Client;
use crate::session::Session;

mod auth;
mod dispatch;

pub use auth::{Authenticator, DenyAll};
pub use dispatch::{SignalingApi, API_VERSION, MAX_CONFERENCE_SIZE};

/// Outcome of handling one incoming message
pub type IncomingResult = Result<Option<Value>, DataError>;

/// Signaling callbacks
///
/// `sender` is `None` for messages relayed in from another node through a
/// pipeline; there is no local client to reply to then.
#[async_trait]
pub trait ChannellingApi: Send + Sync {
    /// A client connected; the returned value is sent as its first message
    async fn on_connect(&self, client: &Arc<Client>, session: &Arc<Session>)
        -> Result<Value, DataError>;

    async fn on_disconnect(&self, client: &Arc<Client>, session: &Arc<Session>);

    /// Handle a decoded message; `Ok(Some(_))` is replied to the sender
    async fn on_incoming(
        &self,
        sender: Option<&Arc<Client>>,
        session: &Arc<Session>,
        msg: &DataIncoming,
    ) -> IncomingResult;

    /// Runs after the reply, if any, has been queued
    async fn on_incoming_processed(
        &self,
        sender: Option<&Arc<Client>>,
        session: &Arc<Session>,
        msg: &DataIncoming,
        result: &IncomingResult,
    );
}
