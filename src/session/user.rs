//! Users group the sessions of one authenticated identity

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::session::Session;
use crate::codec::{DataSession, DataUser};

/// Sessions sharing one user id
#[derive(Debug)]
pub struct User {
    id: String,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a session; returns `true` if it is the first one
    pub fn add_session(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(session.id().to_string(), session);

        let first = sessions.len() == 1;
        if first {
            tracing::debug!(userid = %self.id, "First session registered for user");
        }
        first
    }

    /// Unregister a session; returns `true` if none is left
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(session_id);

        let last = sessions.is_empty();
        if last {
            tracing::debug!(userid = %self.id, "Last session unregistered for user");
        }
        last
    }

    pub fn data(&self) -> DataUser {
        DataUser {
            id: self.id.clone(),
            sessions: self
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Public views of every session, ordered by priority then stamp
    pub fn sessions(&self) -> Vec<DataSession> {
        let mut sessions: Vec<DataSession> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|session| session.data())
            .collect();
        sessions.sort_by(|a, b| a.prio.cmp(&b.prio).then(a.stamp.cmp(&b.stamp)));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_last_session() {
        let user = User::new("alice");
        let a = Arc::new(Session::new("a", "sa"));
        let b = Arc::new(Session::new("b", "sb"));

        assert!(user.add_session(Arc::clone(&a)));
        assert!(!user.add_session(Arc::clone(&b)));
        assert_eq!(user.data().sessions, 2);

        assert!(!user.remove_session("a"));
        assert!(user.remove_session("b"));
    }

    #[test]
    fn test_sessions_sorted_by_prio_then_stamp() {
        let user = User::new("alice");

        let low = Arc::new(Session::new("low", "s"));
        low.set_prio(10);
        let first = Arc::new(Session::new("first", "s"));
        let second = Arc::new(Session::new("second", "s"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        second.set_ua("later");

        user.add_session(low);
        user.add_session(second);
        user.add_session(first);

        let ids: Vec<_> = user.sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["first", "second", "low"]);
    }
}
