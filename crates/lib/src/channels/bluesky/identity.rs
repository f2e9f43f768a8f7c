//! DID -> handle cache. Best-effort: refresh failures are swallowed and a miss resolves to the
//! DID itself, so ingestion never waits on or fails because of identity lookups.

use super::backend::{ChatBackend, Participant, Session};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct IdentityCache {
    handles: HashMap<String, String>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite every participant that has both a DID and a handle.
    /// Returns the number of entries written.
    pub fn upsert(&mut self, participants: impl IntoIterator<Item = Participant>) -> usize {
        let mut written = 0;
        for p in participants {
            if let (Some(did), Some(handle)) = (p.did, p.handle) {
                if did.is_empty() || handle.is_empty() {
                    continue;
                }
                self.handles.insert(did, handle);
                written += 1;
            }
        }
        written
    }

    /// Cached handle for `did`, or `did` verbatim on a miss.
    pub fn resolve<'a>(&'a self, did: &'a str) -> &'a str {
        self.handles.get(did).map(String::as_str).unwrap_or(did)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Re-list conversations and upsert their members. Errors are logged and dropped.
    pub(crate) async fn refresh(&mut self, backend: &dyn ChatBackend, session: &Session) {
        match backend.list_convos(session).await {
            Ok(participants) => {
                let n = self.upsert(participants);
                log::debug!("bluesky: identity cache refreshed ({} entries)", n);
            }
            Err(e) => log::debug!("bluesky: identity refresh failed: {}", e),
        }
    }
}
