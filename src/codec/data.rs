//! Wire data model
//!
//! Field names follow the JSON protocol spoken by browser clients
//! (PascalCase keys, `Type` discriminators).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Free-form SDP / ICE payload
pub type Payload = Map<String, Value>;

/// Room credentials supplied on join
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRoomCredentials {
    #[serde(rename = "PIN", default, skip_serializing_if = "String::is_empty")]
    pub pin: String,
}

/// Room description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataRoom {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<DataRoomCredentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataJoinRoom {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ua: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<DataRoomCredentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataChatMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mid: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_echo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

/// Chat message; empty `to` means the whole room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataChat {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub r#type: String,
    pub chat: DataChatMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataOffer {
    pub to: String,
    #[serde(default)]
    pub r#type: String,
    pub offer: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataCandidate {
    pub to: String,
    #[serde(default)]
    pub r#type: String,
    pub candidate: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataAnswer {
    pub to: String,
    #[serde(default)]
    pub r#type: String,
    pub answer: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataBye {
    pub to: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bye: Option<Payload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataStatus {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub status: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataConference {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub conference: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataAlive {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub alive: u64,
}

/// Opaque session credentials presented for authentication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionToken {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub userid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataAuthentication {
    #[serde(default)]
    pub r#type: String,
    pub authentication: SessionToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSessionsRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

/// Sessions request, and the reply listing matching sessions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSessions {
    #[serde(default)]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<DataSessionsRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<DataSession>,
}

/// Public view of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSession {
    #[serde(default)]
    pub r#type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub userid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ua: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default)]
    pub prio: i32,
    /// Last update, unix millis. Only used for ordering.
    #[serde(skip)]
    pub stamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSelf {
    pub r#type: String,
    pub id: String,
    pub sid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub userid: String,
    pub version: String,
    pub api_version: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataWelcome {
    pub r#type: String,
    pub room: DataRoom,
    pub users: Vec<DataSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataUser {
    pub id: String,
    pub sessions: usize,
}

/// Subject pair of a sink, as exported to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSink {
    pub subject_out: String,
    pub subject_in: String,
}

/// Typed protocol error sent back to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataError {
    pub r#type: String,
    pub code: String,
    pub message: String,
}

impl DataError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            r#type: "Error".to_string(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DataError {}

/// Outgoing envelope delivered to a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataOutgoing {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iid: String,
    #[serde(default)]
    pub data: Value,
}

/// Entry recorded in a pipeline and written to its sink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RelayEntry {
    pub outgoing: DataOutgoing,
    #[serde(default)]
    pub to_userid: String,
    #[serde(default)]
    pub from_userid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pipe: String,
}

/// A decoded signaling message
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    SelfInfo,
    JoinRoom(DataJoinRoom),
    Leave,
    Room(DataRoom),
    Chat(DataChat),
    Offer(DataOffer),
    Candidate(DataCandidate),
    Answer(DataAnswer),
    Users,
    Authentication(DataAuthentication),
    Bye(DataBye),
    Status(DataStatus),
    Conference(DataConference),
    Alive(DataAlive),
    Sessions(DataSessions),
    /// Unrecognized `Type`, kept for logging
    Unknown(String),
}

impl Signal {
    /// Wire name of the message type
    pub fn kind(&self) -> &str {
        match self {
            Signal::SelfInfo => "Self",
            Signal::JoinRoom(_) => "JoinRoom",
            Signal::Leave => "Leave",
            Signal::Room(_) => "Room",
            Signal::Chat(_) => "Chat",
            Signal::Offer(_) => "Offer",
            Signal::Candidate(_) => "Candidate",
            Signal::Answer(_) => "Answer",
            Signal::Users => "Users",
            Signal::Authentication(_) => "Authentication",
            Signal::Bye(_) => "Bye",
            Signal::Status(_) => "Status",
            Signal::Conference(_) => "Conference",
            Signal::Alive(_) => "Alive",
            Signal::Sessions(_) => "Sessions",
            Signal::Unknown(kind) => kind,
        }
    }
}

/// Inbound envelope: `{Type, Iid, <Type>: payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawIncoming", into = "RawIncoming")]
pub struct DataIncoming {
    pub iid: String,
    pub signal: Signal,
}

impl DataIncoming {
    pub fn new(iid: impl Into<String>, signal: Signal) -> Self {
        Self {
            iid: iid.into(),
            signal,
        }
    }

    /// Rebuild an inbound message from a relayed outgoing envelope
    ///
    /// The relayed `Data` carries its own `Type`, which selects the payload
    /// slot of the envelope.
    pub fn from_relayed(outgoing: &DataOutgoing) -> Result<Self, CodecError> {
        let kind = outgoing
            .data
            .get("Type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut envelope = Map::new();
        envelope.insert("Type".into(), Value::String(kind.clone()));
        envelope.insert(kind, outgoing.data.clone());

        let raw: RawIncoming = serde_json::from_value(Value::Object(envelope))?;
        DataIncoming::try_from(raw)
    }
}

/// Flat serde view of [`DataIncoming`]
#[doc(hidden)]
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawIncoming {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    iid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_room: Option<DataJoinRoom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room: Option<DataRoom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chat: Option<DataChat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<DataOffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<DataCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<DataAnswer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authentication: Option<DataAuthentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bye: Option<DataBye>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<DataStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conference: Option<DataConference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alive: Option<DataAlive>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sessions: Option<DataSessions>,
}

impl TryFrom<RawIncoming> for DataIncoming {
    type Error = CodecError;

    fn try_from(raw: RawIncoming) -> Result<Self, Self::Error> {
        fn required<T>(value: Option<T>, iid: &str, kind: &str) -> Result<T, CodecError> {
            value.ok_or_else(|| CodecError::MissingPayload {
                iid: iid.to_string(),
                kind: kind.to_string(),
            })
        }

        let iid = raw.iid;
        let kind = raw.kind.as_str();
        let signal = match kind {
            "Self" => Signal::SelfInfo,
            "JoinRoom" => Signal::JoinRoom(required(raw.join_room, &iid, kind)?),
            "Leave" => Signal::Leave,
            "Room" => Signal::Room(required(raw.room, &iid, kind)?),
            "Chat" => Signal::Chat(required(raw.chat, &iid, kind)?),
            "Offer" => Signal::Offer(required(raw.offer, &iid, kind)?),
            "Candidate" => Signal::Candidate(required(raw.candidate, &iid, kind)?),
            "Answer" => Signal::Answer(required(raw.answer, &iid, kind)?),
            "Users" => Signal::Users,
            "Authentication" => {
                Signal::Authentication(required(raw.authentication, &iid, kind)?)
            }
            "Bye" => Signal::Bye(required(raw.bye, &iid, kind)?),
            "Status" => Signal::Status(required(raw.status, &iid, kind)?),
            "Conference" => Signal::Conference(required(raw.conference, &iid, kind)?),
            "Alive" => Signal::Alive(required(raw.alive, &iid, kind)?),
            "Sessions" => Signal::Sessions(required(raw.sessions, &iid, kind)?),
            other => Signal::Unknown(other.to_string()),
        };

        Ok(DataIncoming { iid, signal })
    }
}

impl From<DataIncoming> for RawIncoming {
    fn from(incoming: DataIncoming) -> Self {
        let mut raw = RawIncoming {
            kind: incoming.signal.kind().to_string(),
            iid: incoming.iid,
            ..Default::default()
        };
        match incoming.signal {
            Signal::JoinRoom(v) => raw.join_room = Some(v),
            Signal::Room(v) => raw.room = Some(v),
            Signal::Chat(v) => raw.chat = Some(v),
            Signal::Offer(v) => raw.offer = Some(v),
            Signal::Candidate(v) => raw.candidate = Some(v),
            Signal::Answer(v) => raw.answer = Some(v),
            Signal::Authentication(v) => raw.authentication = Some(v),
            Signal::Bye(v) => raw.bye = Some(v),
            Signal::Status(v) => raw.status = Some(v),
            Signal::Conference(v) => raw.conference = Some(v),
            Signal::Alive(v) => raw.alive = Some(v),
            Signal::Sessions(v) => raw.sessions = Some(v),
            Signal::SelfInfo | Signal::Leave | Signal::Users | Signal::Unknown(_) => {}
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_offer_envelope() {
        let incoming: DataIncoming = serde_json::from_value(json!({
            "Type": "Offer",
            "Iid": "7",
            "Offer": {"To": "bob", "Type": "Offer", "Offer": {"sdp": "v=0"}}
        }))
        .unwrap();

        assert_eq!(incoming.iid, "7");
        match incoming.signal {
            Signal::Offer(offer) => {
                assert_eq!(offer.to, "bob");
                assert_eq!(offer.offer["sdp"], "v=0");
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let incoming: DataIncoming =
            serde_json::from_value(json!({"Type": "Teleport", "Iid": "1"})).unwrap();
        assert_eq!(incoming.signal, Signal::Unknown("Teleport".into()));
    }

    #[test]
    fn test_from_relayed() {
        let outgoing = DataOutgoing {
            from: "alice".into(),
            to: "bob".into(),
            iid: String::new(),
            data: json!({"To": "bob", "Type": "Answer", "Answer": {"sdp": "x"}}),
        };

        let incoming = DataIncoming::from_relayed(&outgoing).unwrap();
        match incoming.signal {
            Signal::Answer(answer) => assert_eq!(answer.to, "bob"),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn test_relay_entry_wire_names() {
        let entry = RelayEntry {
            outgoing: DataOutgoing::default(),
            to_userid: "u2".into(),
            from_userid: "u1".into(),
            pipe: "call.a.b".into(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["ToUserid"], "u2");
        assert_eq!(value["FromUserid"], "u1");
        assert_eq!(value["Pipe"], "call.a.b");
    }

    #[test]
    fn test_data_error_display() {
        let err = DataError::new("bad_request", "message did not contain Room");
        assert_eq!(err.r#type, "Error");
        assert_eq!(err.to_string(), "bad_request: message did not contain Room");
    }
}
