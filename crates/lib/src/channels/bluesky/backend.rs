//! Remote chat backend consumed by the Bluesky channel. `XrpcBackend` is the HTTP implementation;
//! tests substitute a scripted one.

use crate::channels::error::{AuthError, FetchError, SendError};
use async_trait::async_trait;
use std::fmt;

/// An authenticated session: our own identity plus the tokens used for subsequent calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Our own native id (DID). Used for self-message filtering.
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("did", &self.did)
            .field("handle", &self.handle)
            .field("access_jwt", &"<redacted>")
            .field("refresh_jwt", &"<redacted>")
            .finish()
    }
}

/// One page of the conversation event log. `logs` are raw entries; classification happens in
/// the log reader so an unknown or malformed entry never fails the whole batch.
#[derive(Debug, Clone, Default)]
pub struct LogBatch {
    pub cursor: Option<String>,
    pub logs: Vec<serde_json::Value>,
}

/// A conversation member as listed by the backend. Either field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participant {
    pub did: Option<String>,
    pub handle: Option<String>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Create a session from an identifier (handle or email) and an app password.
    async fn login(&self, identifier: &str, password: &str) -> Result<Session, AuthError>;

    /// Exchange the refresh token for a fresh session.
    async fn refresh_session(&self, session: &Session) -> Result<Session, AuthError>;

    /// Fetch log entries after `cursor` (`None` = from the start of retained history).
    async fn get_log(&self, session: &Session, cursor: Option<&str>)
        -> Result<LogBatch, FetchError>;

    /// All members of all conversations visible to the session.
    async fn list_convos(&self, session: &Session) -> Result<Vec<Participant>, FetchError>;

    async fn send_message(
        &self,
        session: &Session,
        convo_id: &str,
        text: &str,
    ) -> Result<(), SendError>;
}
