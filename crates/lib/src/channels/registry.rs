//! Channel trait and registry: register, look up, and route to channels by id or group id.

use crate::channels::error::SendError;
use crate::channels::inbound::MessageCallback;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Capability set shared by every channel adapter. Poll-driven and push-driven backends both
/// implement it, so callers can drive any channel uniformly.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel id (e.g. "bluesky"). Also the `channel` tag on inbound messages.
    fn id(&self) -> &str;

    /// Prefix of this channel's group ids (e.g. "bsky" for "bsky:<convo>").
    fn prefix(&self) -> &str;

    /// Store credentials. No network access; callable before `start` and idempotent.
    fn configure(&self, identifier: &str, secret: &str);

    /// Authenticate and begin receiving. Failures are logged, not returned; the channel then
    /// stays stopped until `start` is called again.
    async fn start(&self);

    /// Authenticate for sending only, without receiving. Channels whose receive side can be
    /// skipped override this; the default is a full `start`.
    async fn connect(&self) {
        self.start().await;
    }

    /// True while a session is live and `send` reaches the backend.
    fn is_running(&self) -> bool;

    /// Stop receiving and drop session state. Safe to call repeatedly.
    fn stop(&self);

    /// Send text to a conversation. No-op while the channel is not running.
    async fn send(&self, group_id: &str, text: &str) -> Result<(), SendError>;

    /// Show or clear a typing indicator. Backends without one keep this default no-op.
    fn set_typing(&self, _group_id: &str, _typing: bool) {}

    /// Register the inbound message callback, replacing any previous one.
    fn on_message(&self, callback: MessageCallback);

    /// True iff the required credentials are present. Never touches the network.
    fn is_configured(&self) -> bool;
}

/// Registry of channel ids to channels. Shared across the application.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Channel>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a channel under its id. A channel already registered under that id is stopped.
    pub async fn register(&self, channel: Arc<dyn Channel>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(channel.id().to_string(), channel) {
            old.stop();
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Channel>> {
        let g = self.inner.read().await;
        g.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut ids: Vec<String> = g.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Find the channel that owns a group id, by its `<prefix>:` part.
    pub async fn route(&self, group_id: &str) -> Option<Arc<dyn Channel>> {
        let (prefix, _) = group_id.split_once(':')?;
        let g = self.inner.read().await;
        g.values().find(|c| c.prefix() == prefix).cloned()
    }

    /// Stop every registered channel.
    pub async fn stop_all(&self) {
        let g = self.inner.read().await;
        for channel in g.values() {
            channel.stop();
        }
    }
}
