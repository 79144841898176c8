//! Session identity and presence state

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::codec::DataSession;

/// Length of generated public and secret session ids
pub const SESSION_ID_LENGTH: usize = 32;

/// Random alphanumeric identifier
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Default)]
struct SessionState {
    userid: String,
    roomid: Option<String>,
    ua: String,
    prio: i32,
    stamp: i64,
    status: Option<Value>,
    closed: bool,
}

/// Addressable identity of one signaling endpoint
///
/// The public `id` is what peers address; `sid` is the secret half handed
/// only to the owning client. A remote session mirrors one held by another
/// node and is never bound to a local connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    sid: String,
    remote: bool,
    state: RwLock<SessionState>,
}

impl Session {
    /// Create a session with known ids
    pub fn new(id: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sid: sid.into(),
            remote: false,
            state: RwLock::new(SessionState {
                stamp: now_millis(),
                ..Default::default()
            }),
        }
    }

    /// Create a session with fresh random ids
    pub fn generate() -> Self {
        Self::new(random_id(SESSION_ID_LENGTH), random_id(SESSION_ID_LENGTH))
    }

    /// Mirror of a session living on another node
    pub fn remote(data: &DataSession) -> Self {
        Self {
            id: data.id.clone(),
            sid: String::new(),
            remote: true,
            state: RwLock::new(SessionState {
                userid: data.userid.clone(),
                ua: data.ua.clone(),
                prio: data.prio,
                stamp: now_millis(),
                status: data.status.clone(),
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Public id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Secret id
    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Authenticated user id, empty when anonymous
    pub fn userid(&self) -> String {
        self.read().userid.clone()
    }

    /// Bind the session to a user
    ///
    /// Returns `false` if it already belongs to a different user.
    pub fn set_userid(&self, userid: &str) -> bool {
        let mut state = self.write();
        if !state.userid.is_empty() && state.userid != userid {
            return false;
        }
        state.userid = userid.to_string();
        state.stamp = now_millis();
        true
    }

    /// Room currently joined
    pub fn roomid(&self) -> Option<String> {
        self.read().roomid.clone()
    }

    pub(crate) fn set_roomid(&self, roomid: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.write().roomid, roomid)
    }

    pub fn ua(&self) -> String {
        self.read().ua.clone()
    }

    pub fn set_ua(&self, ua: &str) {
        let mut state = self.write();
        state.ua = ua.to_string();
        state.stamp = now_millis();
    }

    pub fn prio(&self) -> i32 {
        self.read().prio
    }

    pub fn set_prio(&self, prio: i32) {
        self.write().prio = prio;
    }

    /// Last update, unix millis
    pub fn stamp(&self) -> i64 {
        self.read().stamp
    }

    pub fn status(&self) -> Option<Value> {
        self.read().status.clone()
    }

    pub fn set_status(&self, status: Value) {
        let mut state = self.write();
        state.status = Some(status);
        state.stamp = now_millis();
    }

    /// Public view of the session, as listed to room members
    pub fn data(&self) -> DataSession {
        self.data_as("Online")
    }

    /// Public view tagged with an event type (`Joined`, `Left`, `Status`)
    pub fn data_as(&self, kind: &str) -> DataSession {
        let state = self.read();
        DataSession {
            r#type: kind.to_string(),
            id: self.id.clone(),
            userid: state.userid.clone(),
            ua: state.ua.clone(),
            status: state.status.clone(),
            prio: state.prio,
            stamp: state.stamp,
        }
    }

    /// Take over presence state from a session this one replaces
    pub fn replace(&self, old: &Session) {
        if std::ptr::eq(self, old) {
            return;
        }
        let previous = old.read();
        let mut state = self.write();
        state.userid = previous.userid.clone();
        state.roomid = previous.roomid.clone();
        state.ua = previous.ua.clone();
        state.prio = previous.prio;
        state.status = previous.status.clone();
        state.stamp = now_millis();
    }

    /// Mark closed; returns `true` only for the first call
    pub fn close(&self) -> bool {
        let mut state = self.write();
        !std::mem::replace(&mut state.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }
}
