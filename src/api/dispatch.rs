//! Signaling dispatcher
//!
//! Routes every decoded message type to the hub, pipelines and bus.
//! Call signaling (Offer, Candidate, Answer, Bye) goes through a `call`
//! pipeline so it can cross nodes; Offer and Answer carrying a `_token`
//! belong to peer file transfer and screen sharing and skip both the
//! pipeline and the trigger.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use super::{Authenticator, ChannellingApi, IncomingResult};
use crate::bus::{
    BusManager, TRIGGER_ANSWER, TRIGGER_BYE, TRIGGER_CONNECT, TRIGGER_DISCONNECT, TRIGGER_OFFER,
    TRIGGER_SESSION,
};
use crate::codec::{
    DataChat, DataChatMessage, DataConference, DataError, DataIncoming, DataJoinRoom, DataOutgoing,
    DataSelf, DataSessions, DataSessionsRequest, DataWelcome, SessionToken, Signal,
};
use crate::pipeline::{Pipeline, PipelineManager, Pipelines, PIPELINE_NAMESPACE_CALL};
use crate::server::Client;
use crate::session::{Hub, Session, ROOM_TYPE_CONFERENCE};

/// Protocol version reported in `Self`
pub const API_VERSION: f64 = 1.4;

/// Largest participant list accepted in a client-side `Conference`
pub const MAX_CONFERENCE_SIZE: usize = 100;

const TOKEN_KEY: &str = "_token";

/// Built-in [`ChannellingApi`]
pub struct SignalingApi {
    version: String,
    hub: Arc<Hub>,
    bus: Arc<BusManager>,
    pipelines: Arc<Pipelines>,
    authenticator: Arc<dyn Authenticator>,
}

impl SignalingApi {
    pub fn new(
        version: impl Into<String>,
        hub: Arc<Hub>,
        pipelines: Arc<Pipelines>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            version: version.into(),
            bus: Arc::clone(hub.bus()),
            hub,
            pipelines,
            authenticator,
        })
    }

    fn trigger(&self, name: &str, from: &str, payload: &str, pipeline: Option<&Arc<Pipeline>>) {
        let pipeline = pipeline.map(|p| p.id());
        if let Err(e) = self.bus.trigger(name, from, payload, None, pipeline) {
            tracing::debug!(trigger = name, error = %e, "Trigger not queued");
        }
    }

    async fn unicast<T: Serialize>(
        &self,
        session: &Session,
        to: &str,
        data: &T,
        pipeline: Option<&Arc<Pipeline>>,
    ) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode unicast");
                return;
            }
        };
        let outgoing = DataOutgoing {
            from: session.id().to_string(),
            to: to.to_string(),
            data,
            ..Default::default()
        };
        self.hub.unicast(to, &outgoing, pipeline).await;
    }

    async fn call_pipeline(&self, session: &Arc<Session>, to: &str) -> Arc<Pipeline> {
        self.pipelines
            .get_pipeline(PIPELINE_NAMESPACE_CALL, session, to)
            .await
    }

    fn handle_self(&self, session: &Session) -> Result<Value, DataError> {
        let userid = session.userid();
        let data = DataSelf {
            r#type: "Self".to_string(),
            id: session.id().to_string(),
            sid: session.sid().to_string(),
            userid: userid.clone(),
            version: self.version.clone(),
            api_version: API_VERSION,
        };
        self.trigger(TRIGGER_SESSION, session.id(), &userid, None);
        to_reply(&data)
    }

    async fn handle_join_room(&self, session: &Arc<Session>, join: &DataJoinRoom) -> IncomingResult {
        session.set_ua(&join.ua);

        // Older clients send the room name as Id
        let name = if join.name.is_empty() { &join.id } else { &join.name };
        let room = self
            .hub
            .join_room(session, name, &join.r#type, join.credentials.as_ref())
            .await?;

        let welcome = DataWelcome {
            r#type: "Welcome".to_string(),
            room,
            users: self.hub.room_users(session).await,
        };
        to_reply(&welcome).map(Some)
    }

    async fn handle_chat(&self, session: &Arc<Session>, mut chat: DataChat) {
        chat.r#type = "Chat".to_string();
        chat.chat.time = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        if !chat.chat.no_echo {
            self.unicast(session, session.id(), &chat, None).await;
        }

        if chat.to.is_empty() {
            self.hub.stats_counter().count_broadcast_chat();
            match serde_json::to_value(&chat) {
                Ok(data) => self.hub.broadcast(session, data).await,
                Err(e) => tracing::error!(error = %e, "Failed to encode chat"),
            }
            return;
        }

        if chat.chat.status.is_none() {
            self.hub.stats_counter().count_unicast_chat();
        }
        let to = chat.to.clone();
        self.unicast(session, &to, &chat, None).await;

        if !chat.chat.mid.is_empty() {
            let sent = DataChat {
                to,
                r#type: "Chat".to_string(),
                chat: DataChatMessage {
                    mid: chat.chat.mid.clone(),
                    status: Some(json!({"State": "sent"})),
                    ..Default::default()
                },
            };
            self.unicast(session, session.id(), &sent, None).await;
        }
    }

    async fn handle_authentication(&self, session: &Arc<Session>, token: &SessionToken) -> IncomingResult {
        let userid = match self.authenticator.authenticate(session, token) {
            Ok(userid) => userid,
            Err(e) => {
                tracing::info!(session_id = %session.id(), userid = %token.userid, error = %e, "Authentication failed");
                return Err(e);
            }
        };
        if !session.set_userid(&userid) {
            return Err(DataError::new(
                "already_authenticated",
                "session is bound to another user",
            ));
        }
        self.hub.register_user(session).await;
        tracing::info!(session_id = %session.id(), userid = %userid, "Authentication success");

        let reply = self.handle_self(session)?;
        self.hub
            .broadcast(session, to_reply(&session.data_as("Status"))?)
            .await;
        Ok(Some(reply))
    }

    async fn handle_conference(&self, session: &Arc<Session>, mut conference: DataConference) {
        if let Some(room) = session.roomid() {
            if self.hub.room_type(&room).await.as_deref() == Some(ROOM_TYPE_CONFERENCE) {
                tracing::info!(room = %room, "Refusing client-side conference update for server-managed conference");
                return;
            }
        }
        if conference.conference.len() > MAX_CONFERENCE_SIZE {
            tracing::info!(size = conference.conference.len(), "Refusing to create conference above limit");
            return;
        }

        conference.r#type = "Conference".to_string();
        for id in conference.conference.iter().filter(|id| id.as_str() != session.id()) {
            self.unicast(session, id, &conference, None).await;
        }
    }

    async fn handle_sessions(&self, session: &Arc<Session>, request: DataSessionsRequest) -> IncomingResult {
        let users = match request.r#type.as_str() {
            "contact" => {
                let userid = self.authenticator.contact_userid(session, &request.token)?;
                self.hub.user_sessions(&userid).await
            }
            "session" => {
                let id = self
                    .authenticator
                    .decode_attestation(session, &request.token)
                    .map_err(|e| DataError::new("bad_attestation", e.message))?;
                let target = self
                    .hub
                    .get_session(&id)
                    .await
                    .ok_or_else(|| DataError::new("no_such_session", "cannot retrieve session"))?;
                vec![target.data()]
            }
            _ => {
                return Err(DataError::new(
                    "bad_request",
                    "unknown sessions request type",
                ))
            }
        };

        to_reply(&DataSessions {
            r#type: "Sessions".to_string(),
            sessions: Some(request),
            users,
        })
        .map(Some)
    }

    /// Tell a server-managed conference who is in it
    async fn send_conference_room_update(&self, session: &Session) {
        let Some(room) = session.roomid() else {
            return;
        };
        if self.hub.room_type(&room).await.as_deref() != Some(ROOM_TYPE_CONFERENCE) {
            return;
        }

        let ids = self.hub.room_session_ids(&room).await;
        if ids.len() < 2 {
            return;
        }
        let conference = DataConference {
            id: room.clone(),
            r#type: "Conference".to_string(),
            conference: ids,
        };
        let Ok(data) = serde_json::to_value(&conference) else {
            return;
        };
        let outgoing = DataOutgoing {
            to: room.clone(),
            data,
            ..Default::default()
        };
        self.hub.broadcast_room(&room, "", outgoing).await;
    }
}

#[async_trait]
impl ChannellingApi for SignalingApi {
    async fn on_connect(&self, client: &Arc<Client>, session: &Arc<Session>) -> Result<Value, DataError> {
        self.hub.on_connect(client).await;
        let reply = self.handle_self(session)?;
        self.trigger(TRIGGER_CONNECT, session.id(), "", None);
        Ok(reply)
    }

    async fn on_disconnect(&self, client: &Arc<Client>, session: &Arc<Session>) {
        self.hub.on_disconnect(client).await;
        self.trigger(TRIGGER_DISCONNECT, session.id(), "", None);
    }

    async fn on_incoming(
        &self,
        _sender: Option<&Arc<Client>>,
        session: &Arc<Session>,
        msg: &DataIncoming,
    ) -> IncomingResult {
        match &msg.signal {
            Signal::SelfInfo => return self.handle_self(session).map(Some),
            Signal::JoinRoom(join) => return self.handle_join_room(session, join).await,
            Signal::Leave => self.hub.leave_room(session).await,
            Signal::Room(room) => {
                let room = self.hub.update_room(session, room).await?;
                let data = to_reply(&room)?;
                self.hub.broadcast(session, data.clone()).await;
                return Ok(Some(data));
            }
            Signal::Chat(chat) => self.handle_chat(session, chat.clone()).await,
            Signal::Offer(offer) => {
                let mut offer = offer.clone();
                offer.r#type = "Offer".to_string();
                let pipeline = if offer.offer.contains_key(TOKEN_KEY) {
                    None
                } else {
                    let pipeline = self.call_pipeline(session, &offer.to).await;
                    self.trigger(TRIGGER_OFFER, session.id(), &offer.to, Some(&pipeline));
                    Some(pipeline)
                };
                self.unicast(session, &offer.to, &offer, pipeline.as_ref()).await;
            }
            Signal::Candidate(candidate) => {
                let mut candidate = candidate.clone();
                candidate.r#type = "Candidate".to_string();
                let pipeline = self.call_pipeline(session, &candidate.to).await;
                self.unicast(session, &candidate.to, &candidate, Some(&pipeline))
                    .await;
            }
            Signal::Answer(answer) => {
                let mut answer = answer.clone();
                answer.r#type = "Answer".to_string();
                let pipeline = if answer.answer.contains_key(TOKEN_KEY) {
                    None
                } else {
                    let pipeline = self.call_pipeline(session, &answer.to).await;
                    self.trigger(TRIGGER_ANSWER, session.id(), &answer.to, Some(&pipeline));
                    Some(pipeline)
                };
                self.unicast(session, &answer.to, &answer, pipeline.as_ref()).await;
            }
            Signal::Users => return to_reply(&self.hub.room_users(session).await).map(Some),
            Signal::Authentication(auth) => {
                return self
                    .handle_authentication(session, &auth.authentication)
                    .await
            }
            Signal::Bye(bye) => {
                let mut bye = bye.clone();
                bye.r#type = "Bye".to_string();
                let pipeline = self.call_pipeline(session, &bye.to).await;
                self.trigger(TRIGGER_BYE, session.id(), &bye.to, Some(&pipeline));
                self.unicast(session, &bye.to, &bye, Some(&pipeline)).await;
                pipeline.close().await;
            }
            Signal::Status(status) => {
                session.set_status(status.status.clone());
                let data = to_reply(&session.data_as("Status"))?;
                self.hub.broadcast(session, data).await;
            }
            Signal::Conference(conference) => {
                self.handle_conference(session, conference.clone()).await
            }
            Signal::Alive(alive) => {
                let mut alive = alive.clone();
                alive.r#type = "Alive".to_string();
                return to_reply(&alive).map(Some);
            }
            Signal::Sessions(sessions) => {
                let Some(request) = sessions.sessions.clone() else {
                    return Err(DataError::new(
                        "bad_request",
                        "message did not contain Sessions",
                    ));
                };
                return self.handle_sessions(session, request).await;
            }
            Signal::Unknown(kind) => {
                tracing::info!(session_id = %session.id(), kind = %kind, "Unhandled message type");
            }
        }
        Ok(None)
    }

    async fn on_incoming_processed(
        &self,
        _sender: Option<&Arc<Client>>,
        session: &Arc<Session>,
        msg: &DataIncoming,
        result: &IncomingResult,
    ) {
        if result.is_err() {
            return;
        }
        if let Signal::JoinRoom(_) | Signal::Room(_) = msg.signal {
            self.send_conference_room_update(session).await;
        }
    }
}

fn to_reply<T: Serialize + ?Sized>(value: &T) -> Result<Value, DataError> {
    serde_json::to_value(value).map_err(|e| DataError::new("internal_error", e.to_string()))
}
