//! Pluggable session authentication

use crate::codec::{DataError, SessionToken};
use crate::session::Session;

/// Verifies credentials presented by clients
///
/// Token cryptography lives outside the relay; deployments plug in their
/// own implementation.
pub trait Authenticator: Send + Sync {
    /// Check `token` for `session`, returning the user id to bind
    fn authenticate(&self, session: &Session, token: &SessionToken) -> Result<String, DataError>;

    /// Resolve a session attestation to the attested session id
    fn decode_attestation(&self, session: &Session, token: &str) -> Result<String, DataError>;

    /// Resolve a contact token to the contact's user id
    fn contact_userid(&self, _session: &Session, _token: &str) -> Result<String, DataError> {
        Err(DataError::new(
            "contacts_not_enabled",
            "incoming contacts session request with contacts disabled",
        ))
    }
}

/// Rejects every credential
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn authenticate(&self, _session: &Session, _token: &SessionToken) -> Result<String, DataError> {
        Err(DataError::new(
            "authentication_failed",
            "no authenticator configured",
        ))
    }

    fn decode_attestation(&self, _session: &Session, _token: &str) -> Result<String, DataError> {
        Err(DataError::new("bad_attestation", "no authenticator configured"))
    }
}
