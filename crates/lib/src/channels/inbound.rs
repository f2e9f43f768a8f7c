//! Inbound message from a channel: the only shape the routing layer above the adapters sees.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Placeholder content for messages that carry no text (embeds, attachments, stickers).
pub const NON_TEXT_PLACEHOLDER: &str = "[non-text message]";

/// A normalized message received on a channel. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Transport-native message id; unique per channel and the de-duplication key downstream.
    pub id: String,
    /// `<channel-prefix>:<native-conversation-id>`, see [`group_id`] and [`native_conversation_id`].
    pub group_id: String,
    /// Display name of the author, or the opaque author id when it could not be resolved.
    pub sender: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Id of the channel that produced the message (e.g. "bluesky").
    pub channel: String,
}

/// Callback invoked synchronously for each inbound message.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Build a callback that forwards every message into an unbounded tokio channel.
/// Messages are dropped (with a debug log) once the receiver is gone.
pub fn forward_to(tx: mpsc::UnboundedSender<InboundMessage>) -> MessageCallback {
    Arc::new(move |msg: InboundMessage| {
        if tx.send(msg).is_err() {
            log::debug!("inbound receiver closed, dropping message");
        }
    })
}

/// Qualify a native conversation id with a channel prefix.
pub fn group_id(prefix: &str, conversation_id: &str) -> String {
    format!("{}:{}", prefix, conversation_id)
}

/// Strip the channel prefix from a group id. `None` when the id does not carry that prefix
/// or the remaining conversation id is empty.
pub fn native_conversation_id<'a>(prefix: &str, group_id: &'a str) -> Option<&'a str> {
    group_id
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|id| !id.is_empty())
}

/// Message text, or [`NON_TEXT_PLACEHOLDER`] when there is none.
pub(crate) fn content_or_placeholder(text: Option<&str>) -> String {
    match text {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => NON_TEXT_PLACEHOLDER.to_string(),
    }
}
