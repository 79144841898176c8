//! JSON codec over pooled buffers

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::CodecError;

use super::data::{DataIncoming, DataOutgoing, RawIncoming};

/// Default limit for incoming messages (1 MiB)
pub const DEFAULT_INCOMING_LIMIT: usize = 1024 * 1024;

/// JSON codec for the signaling protocol
#[derive(Debug, Clone)]
pub struct Codec {
    pool: BufferPool,
    incoming_limit: usize,
}

impl Codec {
    /// Create a codec with its own buffer pool
    pub fn new(incoming_limit: usize) -> Self {
        Self::with_pool(BufferPool::new(), incoming_limit)
    }

    /// Create a codec sharing an existing pool
    pub fn with_pool(pool: BufferPool, incoming_limit: usize) -> Self {
        Self {
            pool,
            incoming_limit,
        }
    }

    /// Acquire a buffer from the pool
    pub fn new_buffer(&self) -> PooledBuffer {
        self.pool.acquire()
    }

    /// Buffer pool backing this codec
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Configured incoming size limit
    pub fn incoming_limit(&self) -> usize {
        self.incoming_limit
    }

    /// Decode one inbound message
    pub fn decode_incoming(&self, buffer: &PooledBuffer) -> Result<DataIncoming, CodecError> {
        let size = buffer.len();
        if size > self.incoming_limit {
            return Err(CodecError::SizeLimitExceeded {
                size,
                limit: self.incoming_limit,
            });
        }

        let raw: RawIncoming = serde_json::from_slice(buffer.as_bytes())?;
        DataIncoming::try_from(raw)
    }

    /// Encode an outgoing envelope into a fresh pooled buffer
    ///
    /// On failure the buffer goes straight back to the pool.
    pub fn encode_outgoing(&self, outgoing: &DataOutgoing) -> Result<PooledBuffer, CodecError> {
        let mut buffer = self.new_buffer();
        if let Err(e) = serde_json::to_writer(buffer.writer(), outgoing) {
            tracing::error!(error = %e, "Error while encoding JSON");
            return Err(e.into());
        }
        Ok(buffer)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_INCOMING_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::codec::data::*;

    fn buffer_from(codec: &Codec, value: &impl serde::Serialize) -> PooledBuffer {
        let mut buffer = codec.new_buffer();
        serde_json::to_writer(buffer.writer(), value).unwrap();
        buffer
    }

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    #[test]
    fn test_oversized_message_rejected() {
        let codec = Codec::new(16);
        let mut buffer = codec.new_buffer();
        buffer.extend_from_slice(br#"{"Type":"Self","Iid":"1234567890"}"#);

        let err = codec.decode_incoming(&buffer).unwrap_err();
        assert!(matches!(
            err,
            CodecError::SizeLimitExceeded { limit: 16, .. }
        ));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let codec = Codec::default();
        let mut buffer = codec.new_buffer();
        buffer.extend_from_slice(b"{not json");

        assert!(matches!(
            codec.decode_incoming(&buffer),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_missing_payload_keeps_iid() {
        let codec = Codec::default();
        let buffer = buffer_from(&codec, &json!({"Type": "JoinRoom", "Iid": "99"}));

        let err = codec.decode_incoming(&buffer).unwrap_err();
        assert_eq!(err.iid(), Some("99"));
    }

    #[test]
    fn test_encode_outgoing() {
        let codec = Codec::default();
        let outgoing = DataOutgoing {
            from: "alice".into(),
            to: String::new(),
            iid: "3".into(),
            data: json!({"Type": "Alive", "Alive": 1}),
        };

        let buffer = codec.encode_outgoing(&outgoing).unwrap();
        let value: Value = serde_json::from_slice(buffer.as_bytes()).unwrap();
        assert_eq!(value["From"], "alice");
        assert_eq!(value["Iid"], "3");
        assert_eq!(value["Data"]["Alive"], 1);
        assert!(value.get("To").is_none());
    }

    #[test]
    fn test_encode_releases_buffer_to_pool() {
        let codec = Codec::default();
        let buffer = codec.encode_outgoing(&DataOutgoing::default()).unwrap();
        drop(buffer);
        assert_eq!(codec.pool().available(), 1);
    }

    #[test]
    fn test_round_trip_every_type() {
        let codec = Codec::default();
        let session = DataSession {
            r#type: "Online".into(),
            id: "s1".into(),
            userid: "u1".into(),
            ua: String::new(),
            status: Some(json!({"displayName": "Alice"})),
            prio: 100,
            stamp: 0,
        };

        let signals = vec![
            Signal::SelfInfo,
            Signal::JoinRoom(DataJoinRoom {
                id: String::new(),
                name: "lobby".into(),
                r#type: "Room".into(),
                ua: "test".into(),
                credentials: Some(DataRoomCredentials { pin: "1234".into() }),
            }),
            Signal::Leave,
            Signal::Room(DataRoom {
                name: "lobby".into(),
                r#type: "Room".into(),
                credentials: None,
            }),
            Signal::Chat(DataChat {
                to: "bob".into(),
                r#type: "Chat".into(),
                chat: DataChatMessage {
                    mid: "m1".into(),
                    message: "hi".into(),
                    time: String::new(),
                    no_echo: true,
                    status: None,
                },
            }),
            Signal::Offer(DataOffer {
                to: "bob".into(),
                r#type: "Offer".into(),
                offer: payload(json!({"type": "offer", "sdp": "v=0"})),
            }),
            Signal::Candidate(DataCandidate {
                to: "bob".into(),
                r#type: "Candidate".into(),
                candidate: payload(json!({"candidate": "c", "sdpMLineIndex": 0})),
            }),
            Signal::Answer(DataAnswer {
                to: "alice".into(),
                r#type: "Answer".into(),
                answer: payload(json!({"type": "answer", "sdp": "v=0"})),
            }),
            Signal::Users,
            Signal::Authentication(DataAuthentication {
                r#type: "Authentication".into(),
                authentication: SessionToken {
                    id: "s1".into(),
                    sid: "secret".into(),
                    userid: "u1".into(),
                    nonce: "n".into(),
                },
            }),
            Signal::Bye(DataBye {
                to: "bob".into(),
                r#type: "Bye".into(),
                bye: Some(payload(json!({"reason": "hangup"}))),
            }),
            Signal::Status(DataStatus {
                r#type: "Status".into(),
                status: json!({"buddyPicture": null}),
            }),
            Signal::Conference(DataConference {
                id: "lobby".into(),
                r#type: "Conference".into(),
                conference: vec!["a".into(), "b".into()],
            }),
            Signal::Alive(DataAlive {
                r#type: "Alive".into(),
                alive: 1_700_000_000,
            }),
            Signal::Sessions(DataSessions {
                r#type: "Sessions".into(),
                sessions: Some(DataSessionsRequest {
                    id: "u1".into(),
                    r#type: "user".into(),
                    token: String::new(),
                }),
                users: vec![session],
            }),
        ];

        for (i, signal) in signals.into_iter().enumerate() {
            let message = DataIncoming::new(i.to_string(), signal);
            let buffer = buffer_from(&codec, &message);
            let decoded = codec.decode_incoming(&buffer).unwrap();
            assert_eq!(decoded, message, "round trip of {}", message.signal.kind());
        }
    }
}
