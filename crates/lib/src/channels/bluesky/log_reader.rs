//! Cursor-based reader over `chat.bsky.convo.getLog`.
//!
//! The cursor only moves when a fetch succeeds and returns a non-empty cursor; it is stored
//! before the batch is handed out. A failed fetch leaves it untouched so the next attempt
//! re-reads the same window. Batches may overlap at the boundary, so message ids (not the
//! cursor) are the de-duplication key.

use super::backend::{ChatBackend, Session};
use crate::channels::error::FetchError;
use serde::Deserialize;
use serde_json::Value;

const LOG_CREATE_MESSAGE: &str = "chat.bsky.convo.defs#logCreateMessage";
const MESSAGE_VIEW: &str = "chat.bsky.convo.defs#messageView";

/// A "message created" log entry whose payload is a message view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CreatedMessage {
    pub convo_id: String,
    pub id: String,
    pub sender_did: String,
    pub text: Option<String>,
    pub sent_at: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCreateMessage {
    convo_id: String,
    message: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageView {
    id: String,
    #[serde(default)]
    text: Option<String>,
    sender: RawSender,
    #[serde(default)]
    sent_at: Option<String>,
}

#[derive(Deserialize)]
struct RawSender {
    did: String,
}

fn type_tag(v: &Value) -> Option<&str> {
    v.get("$type").and_then(Value::as_str)
}

/// Keep only `logCreateMessage` entries carrying a `messageView`. Everything else (deleted
/// messages, reads, conversation changes, malformed entries) is noise and yields `None`.
pub(crate) fn classify(entry: &Value) -> Option<CreatedMessage> {
    if type_tag(entry) != Some(LOG_CREATE_MESSAGE) {
        return None;
    }
    let raw = match RawCreateMessage::deserialize(entry) {
        Ok(r) => r,
        Err(e) => {
            log::debug!("bluesky: skipping malformed log entry: {}", e);
            return None;
        }
    };
    if type_tag(&raw.message) != Some(MESSAGE_VIEW) {
        return None;
    }
    let view = match RawMessageView::deserialize(&raw.message) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("bluesky: skipping malformed message view: {}", e);
            return None;
        }
    };
    Some(CreatedMessage {
        convo_id: raw.convo_id,
        id: view.id,
        sender_did: view.sender.did,
        text: view.text,
        sent_at: view.sent_at,
    })
}

#[derive(Debug, Default)]
pub(crate) struct LogReader {
    cursor: Option<String>,
}

impl LogReader {
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Fetch the next batch and return its actionable messages in backend order.
    pub async fn next_batch(
        &mut self,
        backend: &dyn ChatBackend,
        session: &Session,
    ) -> Result<Vec<CreatedMessage>, FetchError> {
        let batch = backend.get_log(session, self.cursor.as_deref()).await?;
        if let Some(next) = batch.cursor.filter(|c| !c.is_empty()) {
            self.cursor = Some(next);
        }
        Ok(batch.logs.iter().filter_map(classify).collect())
    }
}
