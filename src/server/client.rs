//! Client: a session bound to a live connection
//!
//! The client is the [`ConnectionHandler`] of its connection. It decodes
//! text frames, hands them to the [`ChannellingApi`] and replies with
//! `{From, Iid, Data}` envelopes.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::api::ChannellingApi;
use crate::buffer::{Message, PooledBuffer};
use crate::codec::{Codec, DataError, DataOutgoing};
use crate::server::connection::Connection;
use crate::server::handler::ConnectionHandler;
use crate::session::Session;

pub struct Client {
    session: Arc<Session>,
    codec: Codec,
    api: Arc<dyn ChannellingApi>,
    connection: OnceLock<Arc<Connection>>,
    me: Weak<Client>,
}

impl Client {
    pub fn new(session: Arc<Session>, codec: Codec, api: Arc<dyn ChannellingApi>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            session,
            codec,
            api,
            connection: OnceLock::new(),
            me: me.clone(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Bound connection, once connected
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.get()
    }

    /// Index of the bound connection, 0 before connect
    pub fn index(&self) -> u64 {
        self.connection.get().map(|c| c.index()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.connection.get().map(|c| c.is_closed()).unwrap_or(true)
    }

    /// Queue a message on the connection
    pub fn send(&self, message: &Message) {
        match self.connection.get() {
            Some(connection) => connection.send(message),
            None => tracing::debug!(session_id = %self.session.id(), "Send before connect"),
        }
    }

    /// Encode and queue an outgoing envelope
    pub fn send_outgoing(&self, outgoing: &DataOutgoing) {
        match self.codec.encode_outgoing(outgoing) {
            Ok(buffer) => self.send(&Message::text(buffer)),
            Err(e) => {
                tracing::error!(session_id = %self.session.id(), error = %e, "Failed to encode outgoing")
            }
        }
    }

    /// Reply to the message with request id `iid`
    pub fn reply(&self, iid: &str, data: Value) {
        self.send_outgoing(&DataOutgoing {
            from: self.session.id().to_string(),
            iid: iid.to_string(),
            data,
            ..Default::default()
        });
    }

    fn reply_error(&self, iid: &str, error: &DataError) {
        match serde_json::to_value(error) {
            Ok(data) => self.reply(iid, data),
            Err(e) => tracing::error!(error = %e, "Failed to encode error reply"),
        }
    }

    pub fn close(&self) {
        if let Some(connection) = self.connection.get() {
            connection.close();
        }
    }

    /// Take over from a stale client of the same session
    ///
    /// The old client is closed on a separate task so a hung connection
    /// cannot hold up this one.
    pub fn replace_and_close(&self, old: Arc<Client>) {
        self.session.replace(&old.session);

        let index = self.index();
        tokio::spawn(async move {
            tracing::info!(
                session_id = %old.session.id(),
                old = old.index(),
                new = index,
                "Closing obsolete client"
            );
            old.session.close();
            old.close();
        });
    }
}

#[async_trait]
impl ConnectionHandler for Client {
    fn new_buffer(&self) -> PooledBuffer {
        self.codec.new_buffer()
    }

    async fn on_connect(&self, connection: Arc<Connection>) {
        if self.connection.set(connection).is_err() {
            tracing::warn!(session_id = %self.session.id(), "Client connected twice");
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        match self.api.on_connect(&me, &self.session).await {
            Ok(reply) => self.reply("", reply),
            Err(e) => tracing::warn!(session_id = %self.session.id(), error = %e, "Connect rejected"),
        }
    }

    async fn on_text(&self, buffer: &PooledBuffer) {
        let incoming = match self.codec.decode_incoming(buffer) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session.id(),
                    error = %e,
                    "Error while processing incoming message"
                );
                if let Some(iid) = e.iid() {
                    self.reply_error(iid, &DataError::new("bad_request", e.to_string()));
                }
                return;
            }
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let result = self.api.on_incoming(Some(&me), &self.session, &incoming).await;
        match &result {
            Ok(Some(reply)) => self.reply(&incoming.iid, reply.clone()),
            Ok(None) => {}
            Err(error) => self.reply_error(&incoming.iid, error),
        }

        self.api
            .on_incoming_processed(Some(&me), &self.session, &incoming, &result)
            .await;
    }

    async fn on_disconnect(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.session.close();
        self.api.on_disconnect(&me, &self.session).await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session.id())
            .field("index", &self.index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::api::IncomingResult;
    use crate::codec::{DataIncoming, Signal};
    use crate::server::config::ConnectionConfig;

    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<String>>,
        disconnected: Mutex<bool>,
    }

    #[async_trait]
    impl ChannellingApi for Echo {
        async fn on_connect(
            &self,
            _client: &Arc<Client>,
            session: &Arc<Session>,
        ) -> Result<Value, DataError> {
            Ok(json!({"Type": "Self", "Id": session.id()}))
        }

        async fn on_disconnect(&self, _client: &Arc<Client>, _session: &Arc<Session>) {
            *self.disconnected.lock().unwrap() = true;
        }

        async fn on_incoming(
            &self,
            _sender: Option<&Arc<Client>>,
            _session: &Arc<Session>,
            msg: &DataIncoming,
        ) -> IncomingResult {
            match &msg.signal {
                Signal::Alive(alive) => Ok(Some(json!({"Type": "Alive", "Alive": alive.alive}))),
                Signal::Leave => Err(DataError::new("not_in_room", "nope")),
                _ => Ok(None),
            }
        }

        async fn on_incoming_processed(
            &self,
            _sender: Option<&Arc<Client>>,
            _session: &Arc<Session>,
            msg: &DataIncoming,
            _result: &IncomingResult,
        ) {
            self.seen.lock().unwrap().push(msg.signal.kind().to_string());
        }
    }

    fn connected() -> (Arc<Client>, Arc<Connection>, Arc<Echo>) {
        let api = Arc::new(Echo::default());
        let client = Client::new(
            Arc::new(Session::new("alice", "secret")),
            Codec::default(),
            Arc::clone(&api) as Arc<dyn ChannellingApi>,
        );
        let connection = Connection::new(1, ConnectionConfig::default());
        (client, connection, api)
    }

    fn buffer(client: &Client, text: &str) -> PooledBuffer {
        let mut buffer = client.new_buffer();
        buffer.extend_from_slice(text.as_bytes());
        buffer
    }

    #[tokio::test]
    async fn test_connect_sends_self() {
        let (client, connection, _api) = connected();

        client.on_connect(Arc::clone(&connection)).await;

        assert_eq!(client.index(), 1);
        assert_eq!(connection.queued(), 1);
    }

    #[tokio::test]
    async fn test_reply_and_error_reply() {
        let (client, connection, api) = connected();
        client.on_connect(Arc::clone(&connection)).await;

        client
            .on_text(&buffer(&client, r#"{"Type":"Alive","Iid":"1","Alive":{"Alive":5}}"#))
            .await;
        client
            .on_text(&buffer(&client, r#"{"Type":"Leave","Iid":"2"}"#))
            .await;
        client
            .on_text(&buffer(&client, r#"{"Type":"Users"}"#))
            .await;

        // Self, Alive reply, error reply; Users produced nothing
        assert_eq!(connection.queued(), 3);
        assert_eq!(*api.seen.lock().unwrap(), vec!["Alive", "Leave", "Users"]);
    }

    #[tokio::test]
    async fn test_missing_payload_with_iid_gets_bad_request() {
        let (client, connection, api) = connected();
        client.on_connect(Arc::clone(&connection)).await;

        client
            .on_text(&buffer(&client, r#"{"Type":"Offer","Iid":"7"}"#))
            .await;
        client.on_text(&buffer(&client, "not json")).await;

        // Self plus one bad_request; garbage without an iid is only logged
        assert_eq!(connection.queued(), 2);
        assert!(api.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let (client, connection, api) = connected();
        client.on_connect(connection).await;

        client.on_disconnect().await;

        assert!(client.session().is_closed());
        assert!(*api.disconnected.lock().unwrap());
    }

    #[tokio::test]
    async fn test_replace_and_close() {
        let (old, old_connection, _) = connected();
        old.on_connect(Arc::clone(&old_connection)).await;
        old.session().set_userid("u-alice");

        let (new, new_connection, _) = connected();
        new.on_connect(Arc::clone(&new_connection)).await;
        new.replace_and_close(Arc::clone(&old));

        tokio::task::yield_now().await;

        assert!(old_connection.is_closed());
        assert!(!new_connection.is_closed());
        assert_eq!(new.session().userid(), "u-alice");
    }
}
