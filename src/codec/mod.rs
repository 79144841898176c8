//! Signaling codec
//!
//! Converts between transport frames and typed signaling messages. Inbound
//! frames are size-checked before parsing; outbound envelopes are written
//! straight into pooled buffers.

pub mod data;
pub mod json;

pub use data::{
    DataAlive, DataAnswer, DataAuthentication, DataBye, DataCandidate, DataChat,
    DataChatMessage, DataConference, DataError, DataIncoming, DataJoinRoom, DataOffer,
    DataOutgoing, DataRoom, DataRoomCredentials, DataSelf, DataSession, DataSessions,
    DataSessionsRequest, DataSink, DataStatus, DataUser, DataWelcome, Payload, RelayEntry,
    SessionToken, Signal,
};
pub use json::Codec;
