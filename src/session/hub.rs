//! Session directory and router
//!
//! The hub knows every client connected to this node, the rooms they joined
//! and the users they authenticated as. It delivers unicasts to local
//! clients (or hands them to a pipeline) and fans room broadcasts out to
//! local members and, over the bus, to every other node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::session::Session;
use super::user::User;
use crate::buffer::Message;
use crate::bus::{BusManager, Subscription};
use crate::codec::{Codec, DataError, DataOutgoing, DataRoom, DataRoomCredentials, DataSession};
use crate::error::BusError;
use crate::pipeline::Pipeline;
use crate::server::Client;
use crate::stats::{HubStats, StatsCounter};

/// Room type whose membership is managed by the server
pub const ROOM_TYPE_CONFERENCE: &str = "Conference";

/// Default room type
pub const ROOM_TYPE_ROOM: &str = "Room";

const ROOM_BROADCAST_SUBJECT: &str = "room.broadcast";
const ROOM_BROADCAST_QUEUE: usize = 256;

#[derive(Debug)]
struct Room {
    name: String,
    kind: String,
    pin: String,
    /// Session ids, in join order
    members: Vec<String>,
}

impl Room {
    fn data(&self) -> DataRoom {
        DataRoom {
            name: self.name.clone(),
            r#type: self.kind.clone(),
            credentials: None,
        }
    }
}

/// Room broadcast forwarded between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoomBroadcast {
    node: String,
    room: String,
    #[serde(default)]
    exclude: String,
    outgoing: DataOutgoing,
}

/// Session directory, room registry and router
pub struct Hub {
    codec: Codec,
    bus: Arc<BusManager>,
    stats: Arc<StatsCounter>,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    rooms: RwLock<HashMap<String, Room>>,
    users: RwLock<HashMap<String, Arc<User>>>,
    broadcasts: Mutex<Option<(Subscription, JoinHandle<()>)>>,
    me: Weak<Hub>,
}

impl Hub {
    pub fn new(codec: Codec, bus: Arc<BusManager>, stats: Arc<StatsCounter>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            codec,
            bus,
            stats,
            clients: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            broadcasts: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn bus(&self) -> &Arc<BusManager> {
        &self.bus
    }

    pub fn stats_counter(&self) -> &Arc<StatsCounter> {
        &self.stats
    }

    /// Receive room broadcasts from other nodes
    pub async fn start(&self) -> Result<(), BusError> {
        if !self.bus.is_distributed() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<RoomBroadcast>(ROOM_BROADCAST_QUEUE);
        let subject = self.bus.prefix_subject(ROOM_BROADCAST_SUBJECT);
        let subscription = self.bus.bind_recv_chan(&subject, tx).await?;

        let hub = self.me.clone();
        let node = self.bus.node_id().to_string();
        let task = tokio::spawn(async move {
            while let Some(broadcast) = rx.recv().await {
                if broadcast.node == node {
                    continue;
                }
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.deliver_room(&broadcast.room, &broadcast.exclude, &broadcast.outgoing)
                    .await;
            }
        });

        *self.broadcasts.lock().unwrap_or_else(PoisonError::into_inner) = Some((subscription, task));
        Ok(())
    }

    pub fn stop(&self) {
        if let Some((subscription, task)) = self
            .broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            subscription.unsubscribe();
            task.abort();
        }
    }

    /// Session for a new connection
    ///
    /// A reconnecting client presents its previous ids; when the secret id
    /// matches a known session the public id is kept.
    pub async fn create_session(&self, reconnect: Option<(&str, &str)>) -> Arc<Session> {
        if let Some((id, sid)) = reconnect {
            if let Some(existing) = self.get_session(id).await {
                if existing.sid() == sid {
                    return Arc::new(Session::new(id, sid));
                }
                tracing::warn!(session_id = %id, "Reconnect with mismatched secret id");
            }
        }
        Arc::new(Session::generate())
    }

    /// Register a connected client, closing any stale client of its session
    pub async fn on_connect(&self, client: &Arc<Client>) {
        let session = client.session();
        let old = self
            .clients
            .write()
            .await
            .insert(session.id().to_string(), Arc::clone(client));

        if let Some(old) = old {
            if !Arc::ptr_eq(&old, client) {
                client.replace_and_close(old);
                let userid = session.userid();
                if !userid.is_empty() {
                    self.register_user(session).await;
                }
            }
        }

        tracing::debug!(session_id = %session.id(), index = client.index(), "Client registered");
    }

    /// Unregister a client
    ///
    /// Ignored when the client was already replaced by a newer one.
    pub async fn on_disconnect(&self, client: &Arc<Client>) {
        let session = client.session();
        {
            let mut clients = self.clients.write().await;
            match clients.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, client) => {
                    clients.remove(session.id());
                }
                _ => return,
            }
        }

        self.leave_room(session).await;

        let userid = session.userid();
        if !userid.is_empty() {
            let mut users = self.users.write().await;
            if let Some(user) = users.get(&userid) {
                if user.remove_session(session.id()) {
                    users.remove(&userid);
                }
            }
        }

        tracing::debug!(session_id = %session.id(), "Client unregistered");
    }

    pub async fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.get_client(id).await.map(|c| Arc::clone(c.session()))
    }

    /// Deliver to one session
    ///
    /// With a pipeline, a target not connected here is relayed through it.
    pub async fn unicast(&self, to: &str, outgoing: &DataOutgoing, pipeline: Option<&Arc<Pipeline>>) {
        let client = self.get_client(to).await;

        if let Some(pipeline) = pipeline {
            if pipeline.flush_outgoing(client.is_some(), to, outgoing).await {
                return;
            }
        }

        match client {
            Some(client) => client.send_outgoing(outgoing),
            None => tracing::debug!(to = %to, "Unicast target not found"),
        }
    }

    /// Send `data` from `session` to everyone else in its room, fleet-wide
    pub async fn broadcast(&self, session: &Session, data: Value) {
        let Some(room) = session.roomid() else {
            tracing::debug!(session_id = %session.id(), "Broadcast outside of a room");
            return;
        };

        let outgoing = DataOutgoing {
            from: session.id().to_string(),
            to: room.clone(),
            data,
            ..Default::default()
        };
        self.broadcast_room(&room, session.id(), outgoing).await;
    }

    /// Send `outgoing` to every member of `room` except `exclude`, fleet-wide
    pub async fn broadcast_room(&self, room: &str, exclude: &str, outgoing: DataOutgoing) {
        self.deliver_room(room, exclude, &outgoing).await;

        if self.bus.is_distributed() {
            let subject = self.bus.prefix_subject(ROOM_BROADCAST_SUBJECT);
            let broadcast = RoomBroadcast {
                node: self.bus.node_id().to_string(),
                room: room.to_string(),
                exclude: exclude.to_string(),
                outgoing,
            };
            if let Err(e) = self.bus.publish(&subject, &broadcast).await {
                tracing::warn!(room = %room, error = %e, "Failed to forward room broadcast");
            }
        }
    }

    async fn deliver_room(&self, room: &str, exclude: &str, outgoing: &DataOutgoing) {
        let members = match self.rooms.read().await.get(room) {
            Some(room) => room.members.clone(),
            None => return,
        };

        let buffer = match self.codec.encode_outgoing(outgoing) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::error!(room = %room, error = %e, "Failed to encode broadcast");
                return;
            }
        };
        let message = Message::text(buffer);

        let clients = self.clients.read().await;
        for id in members.iter().filter(|id| id.as_str() != exclude) {
            if let Some(client) = clients.get(id) {
                client.send(&message);
            }
        }
    }

    /// Join `name`, leaving any other room first
    pub async fn join_room(
        &self,
        session: &Arc<Session>,
        name: &str,
        kind: &str,
        credentials: Option<&DataRoomCredentials>,
    ) -> Result<DataRoom, DataError> {
        if let Some(current) = session.roomid() {
            if current != name {
                self.leave_room(session).await;
            }
        }

        let room = {
            let mut rooms = self.rooms.write().await;
            let room = rooms.entry(name.to_string()).or_insert_with(|| Room {
                name: name.to_string(),
                kind: if kind.is_empty() { ROOM_TYPE_ROOM } else { kind }.to_string(),
                pin: String::new(),
                members: Vec::new(),
            });

            if !room.pin.is_empty() {
                match credentials {
                    None => {
                        return Err(DataError::new(
                            "authorization_required",
                            "Room requires authorization",
                        ))
                    }
                    Some(c) if c.pin != room.pin => {
                        return Err(DataError::new(
                            "invalid_credentials",
                            "Invalid room credentials",
                        ))
                    }
                    Some(_) => {}
                }
            }

            if !room.members.iter().any(|id| id == session.id()) {
                room.members.push(session.id().to_string());
            }
            room.data()
        };

        session.set_roomid(Some(name.to_string()));
        tracing::info!(session_id = %session.id(), room = %name, "Joined room");

        self.broadcast(session, to_value(session.data_as("Joined")))
            .await;
        Ok(room)
    }

    /// Leave the current room, if any
    pub async fn leave_room(&self, session: &Session) {
        let Some(name) = session.roomid() else {
            return;
        };

        // Announce while still a member so the broadcast is scoped correctly
        self.broadcast(session, to_value(session.data_as("Left"))).await;

        session.set_roomid(None);
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&name) {
            room.members.retain(|id| id != session.id());
            if room.members.is_empty() {
                rooms.remove(&name);
                tracing::debug!(room = %name, "Room closed");
            }
        }
        tracing::info!(session_id = %session.id(), room = %name, "Left room");
    }

    /// Update type or credentials of the session's room
    pub async fn update_room(&self, session: &Session, update: &DataRoom) -> Result<DataRoom, DataError> {
        let current = session.roomid();
        if current.as_deref() != Some(update.name.as_str()) {
            return Err(DataError::new("not_in_room", "Cannot update other rooms"));
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(&update.name)
            .ok_or_else(|| DataError::new("not_in_room", "Cannot update other rooms"))?;

        if !update.r#type.is_empty() && room.kind != ROOM_TYPE_CONFERENCE {
            room.kind = update.r#type.clone();
        }
        if let Some(credentials) = &update.credentials {
            room.pin = credentials.pin.clone();
        }
        Ok(room.data())
    }

    /// Sessions in the same room as `session`
    pub async fn room_users(&self, session: &Session) -> Vec<DataSession> {
        let Some(name) = session.roomid() else {
            return Vec::new();
        };
        let ids = self.room_session_ids(&name).await;

        let clients = self.clients.read().await;
        ids.iter()
            .filter(|id| id.as_str() != session.id())
            .filter_map(|id| clients.get(id))
            .map(|client| client.session().data())
            .collect()
    }

    pub async fn room_session_ids(&self, name: &str) -> Vec<String> {
        self.rooms
            .read()
            .await
            .get(name)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    pub async fn room_type(&self, name: &str) -> Option<String> {
        self.rooms.read().await.get(name).map(|room| room.kind.clone())
    }

    /// Track an authenticated session under its user
    pub async fn register_user(&self, session: &Arc<Session>) {
        let userid = session.userid();
        if userid.is_empty() {
            return;
        }

        let user = {
            let mut users = self.users.write().await;
            Arc::clone(
                users
                    .entry(userid.clone())
                    .or_insert_with(|| Arc::new(User::new(userid.clone()))),
            )
        };
        user.add_session(Arc::clone(session));
    }

    /// Sessions of `userid`, by priority then stamp
    pub async fn user_sessions(&self, userid: &str) -> Vec<DataSession> {
        match self.users.read().await.get(userid) {
            Some(user) => user.sessions(),
            None => Vec::new(),
        }
    }

    /// Snapshot of counts
    pub async fn stat(&self) -> HubStats {
        let (connections, sessions) = {
            let clients = self.clients.read().await;
            let open = clients.values().filter(|c| !c.is_closed()).count();
            (open, clients.len())
        };

        HubStats {
            rooms: self.rooms.read().await.len(),
            connections,
            sessions,
            users: self.users.read().await.len(),
            count: self.stats.connections(),
            broadcast_chat_messages: self.stats.broadcast_chat_messages(),
            unicast_chat_messages: self.stats.unicast_chat_messages(),
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.stop();
    }
}

fn to_value(session: DataSession) -> Value {
    serde_json::to_value(session).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::api::{ChannellingApi, IncomingResult};
    use crate::bus::{BusConfig, LocalBus};
    use crate::codec::DataIncoming;
    use crate::server::config::ConnectionConfig;
    use crate::server::connection::Connection;

    struct Silent;

    #[async_trait]
    impl ChannellingApi for Silent {
        async fn on_connect(
            &self,
            _client: &Arc<Client>,
            _session: &Arc<Session>,
        ) -> Result<Value, DataError> {
            Ok(Value::Null)
        }

        async fn on_disconnect(&self, _client: &Arc<Client>, _session: &Arc<Session>) {}

        async fn on_incoming(
            &self,
            _sender: Option<&Arc<Client>>,
            _session: &Arc<Session>,
            _msg: &DataIncoming,
        ) -> IncomingResult {
            Ok(None)
        }

        async fn on_incoming_processed(
            &self,
            _sender: Option<&Arc<Client>>,
            _session: &Arc<Session>,
            _msg: &DataIncoming,
            _result: &IncomingResult,
        ) {
        }
    }

    fn hub_on(bus: Arc<BusManager>) -> Arc<Hub> {
        Hub::new(Codec::default(), bus, Arc::new(StatsCounter::new()))
    }

    fn hub() -> Arc<Hub> {
        hub_on(BusManager::noop(BusConfig::default()))
    }

    async fn connect(hub: &Hub, session: Arc<Session>) -> (Arc<Client>, Arc<Connection>) {
        let client = Client::new(session, hub.codec().clone(), Arc::new(Silent));
        let connection = Connection::new(hub.stats.next_connection(), ConnectionConfig::default());
        crate::server::handler::ConnectionHandler::on_connect(&*client, Arc::clone(&connection)).await;
        connection.take_queued();
        hub.on_connect(&client).await;
        (client, connection)
    }

    fn received(connection: &Connection) -> Vec<Value> {
        connection
            .take_queued()
            .iter()
            .map(|m| serde_json::from_slice(m.as_bytes()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_create_session_reconnect() {
        let hub = hub();
        let (_client, _) = connect(&hub, Arc::new(Session::new("alice", "secret"))).await;

        let same = hub.create_session(Some(("alice", "secret"))).await;
        assert_eq!(same.id(), "alice");

        let other = hub.create_session(Some(("alice", "guess"))).await;
        assert_ne!(other.id(), "alice");
        assert_eq!(other.id().len(), crate::session::SESSION_ID_LENGTH);

        let fresh = hub.create_session(None).await;
        assert_ne!(fresh.id(), other.id());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_stale_client() {
        let hub = hub();
        let (old, old_conn) = connect(&hub, Arc::new(Session::new("alice", "secret"))).await;
        old.session().set_userid("u1");
        hub.register_user(old.session()).await;

        let (new, new_conn) = connect(&hub, Arc::new(Session::new("alice", "secret"))).await;
        tokio::task::yield_now().await;

        assert!(old_conn.is_closed());
        assert!(!new_conn.is_closed());
        assert_eq!(new.session().userid(), "u1");
        assert!(Arc::ptr_eq(&hub.get_client("alice").await.unwrap(), &new));

        // The stale client's disconnect must not evict the new one
        hub.on_disconnect(&old).await;
        assert!(hub.get_client("alice").await.is_some());
        assert_eq!(hub.user_sessions("u1").await.len(), 1);

        hub.on_disconnect(&new).await;
        assert!(hub.get_client("alice").await.is_none());
        assert!(hub.user_sessions("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_rooms_join_leave_and_close() {
        let hub = hub();
        let (alice, alice_conn) = connect(&hub, Arc::new(Session::new("alice", "a"))).await;
        let (bob, bob_conn) = connect(&hub, Arc::new(Session::new("bob", "b"))).await;

        hub.join_room(alice.session(), "lobby", "", None).await.unwrap();
        let room = hub.join_room(bob.session(), "lobby", "", None).await.unwrap();
        assert_eq!(room.r#type, ROOM_TYPE_ROOM);
        assert_eq!(hub.room_session_ids("lobby").await, vec!["alice", "bob"]);
        assert_eq!(hub.room_users(bob.session()).await[0].id, "alice");

        let joined = received(&alice_conn);
        assert_eq!(joined[0]["Data"]["Type"], "Joined");
        assert!(received(&bob_conn).is_empty());

        // Joining another room leaves the first one
        hub.join_room(bob.session(), "other", "", None).await.unwrap();
        assert_eq!(received(&alice_conn)[0]["Data"]["Type"], "Left");
        assert_eq!(hub.room_session_ids("lobby").await, vec!["alice"]);

        hub.leave_room(alice.session()).await;
        assert!(alice.session().roomid().is_none());
        assert!(hub.room_type("lobby").await.is_none());
        assert_eq!(hub.stat().await.rooms, 1);
    }

    #[tokio::test]
    async fn test_room_pin_and_type() {
        let hub = hub();
        let (alice, _) = connect(&hub, Arc::new(Session::new("alice", "a"))).await;
        let (bob, _) = connect(&hub, Arc::new(Session::new("bob", "b"))).await;

        hub.join_room(alice.session(), "conf", ROOM_TYPE_CONFERENCE, None)
            .await
            .unwrap();
        let update = DataRoom {
            name: "conf".into(),
            r#type: ROOM_TYPE_ROOM.into(),
            credentials: Some(DataRoomCredentials { pin: "42".into() }),
        };
        let room = hub.update_room(alice.session(), &update).await.unwrap();
        assert_eq!(room.r#type, ROOM_TYPE_CONFERENCE);

        let err = hub.update_room(bob.session(), &update).await.unwrap_err();
        assert_eq!(err.code, "not_in_room");

        let err = hub.join_room(bob.session(), "conf", "", None).await.unwrap_err();
        assert_eq!(err.code, "authorization_required");
        assert!(bob.session().roomid().is_none());

        let good = DataRoomCredentials { pin: "42".into() };
        hub.join_room(bob.session(), "conf", "", Some(&good)).await.unwrap();
        assert_eq!(bob.session().roomid().as_deref(), Some("conf"));
    }

    #[tokio::test]
    async fn test_unicast_local_and_missing() {
        let hub = hub();
        let (_alice, alice_conn) = connect(&hub, Arc::new(Session::new("alice", "a"))).await;

        let outgoing = DataOutgoing {
            from: "bob".into(),
            to: "alice".into(),
            data: json!({"Type": "Offer"}),
            ..Default::default()
        };
        hub.unicast("alice", &outgoing, None).await;
        hub.unicast("nobody", &outgoing, None).await;

        let out = received(&alice_conn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["From"], "bob");
    }

    #[tokio::test]
    async fn test_stat_counts() {
        let hub = hub();
        let (alice, _) = connect(&hub, Arc::new(Session::new("alice", "a"))).await;
        let (_bob, bob_conn) = connect(&hub, Arc::new(Session::new("bob", "b"))).await;
        alice.session().set_userid("u1");
        hub.register_user(alice.session()).await;
        hub.join_room(alice.session(), "lobby", "", None).await.unwrap();
        bob_conn.close();

        let stats = hub.stat().await;
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.users, 1);
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.count, 2);
    }

    #[tokio::test]
    async fn test_room_broadcast_crosses_nodes() {
        let broker = LocalBus::new();
        let hub_a = hub_on(BusManager::local(BusConfig::default().node_id("a"), broker.clone()));
        let hub_b = hub_on(BusManager::local(BusConfig::default().node_id("b"), broker.clone()));
        hub_a.start().await.unwrap();
        hub_b.start().await.unwrap();

        let (alice, alice_conn) = connect(&hub_a, Arc::new(Session::new("alice", "a"))).await;
        let (bob, bob_conn) = connect(&hub_b, Arc::new(Session::new("bob", "b"))).await;
        hub_a.join_room(alice.session(), "lobby", "", None).await.unwrap();
        hub_b.join_room(bob.session(), "lobby", "", None).await.unwrap();

        hub_b.broadcast(bob.session(), json!({"Type": "Chat"})).await;

        let mut out = Vec::new();
        for _ in 0..50 {
            out = received(&alice_conn);
            if out.iter().any(|m| m["Data"]["Type"] == "Chat") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(out.iter().any(|m| m["Data"]["Type"] == "Chat" && m["From"] == "bob"));
        // The sender's own node skips its echo from the bus
        assert!(!received(&bob_conn).iter().any(|m| m["Data"]["Type"] == "Chat"));
    }
}
