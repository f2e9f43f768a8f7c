//! Bluesky direct-message channel: logs in with an app password, polls the chat event log on a
//! fixed interval, and sends replies with `chat.bsky.convo.sendMessage`.
//!
//! Group ids are `bsky:<convoId>`.

mod backend;
#[cfg(test)]
mod fake;
mod identity;
mod ingest;
mod log_reader;
mod session;
mod xrpc;

pub use backend::{ChatBackend, LogBatch, Participant, Session};
pub use identity::IdentityCache;
pub use session::ChannelState;
pub use xrpc::{XrpcBackend, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVICE};

use crate::channels::error::SendError;
use crate::channels::inbound::{native_conversation_id, MessageCallback};
use crate::channels::registry::Channel;
use crate::config::{self, Config};
use async_trait::async_trait;
use ingest::{CallbackSlot, PollContext, PollState};
use session::SessionManager;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const CHANNEL_ID: &str = "bluesky";
pub const GROUP_PREFIX: &str = "bsky";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct BlueskyChannel {
    backend: Arc<dyn ChatBackend>,
    sessions: Arc<SessionManager>,
    callback: CallbackSlot,
    poll_state: Arc<tokio::sync::Mutex<PollState>>,
    poll_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BlueskyChannel {
    pub fn new(backend: Arc<dyn ChatBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            sessions: Arc::new(SessionManager::new()),
            callback: Arc::new(RwLock::new(None)),
            poll_state: Arc::new(tokio::sync::Mutex::new(PollState::default())),
            poll_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build from config: XRPC backend with the configured service and timeout, credentials
    /// from env or config when present.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let c = &config.channels.bluesky;
        let backend = XrpcBackend::new(c.service.clone(), c.request_timeout())?;
        let channel = Self::new(Arc::new(backend), c.poll_interval());
        if let Some((identifier, password)) = config::resolve_bluesky_credentials(config) {
            channel.configure(&identifier, &password);
        }
        Ok(channel)
    }

    pub fn state(&self) -> ChannelState {
        self.sessions.state()
    }

    /// Wait for every poll loop spawned so far to exit, including loops of earlier runs that
    /// were still winding down at a restart. Call after `stop`.
    pub async fn join(&self) {
        let handles =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("bluesky: poll task ended abnormally: {}", e);
            }
        }
    }

    /// Log in and move to `Running`. Returns the run generation, or `None` when the channel
    /// was not startable, the login failed, or `stop` raced the login.
    async fn authenticate(&self) -> Option<u64> {
        let Some(attempt) = self.sessions.begin_login() else {
            log::debug!(
                "bluesky: start skipped (state {:?}, configured: {})",
                self.sessions.state(),
                self.sessions.is_configured()
            );
            return None;
        };
        let result = self
            .backend
            .login(&attempt.identifier, &attempt.secret)
            .await;
        self.sessions.finish_login(attempt.generation, result)
    }
}

#[async_trait]
impl Channel for BlueskyChannel {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn prefix(&self) -> &str {
        GROUP_PREFIX
    }

    fn configure(&self, identifier: &str, secret: &str) {
        self.sessions.configure(identifier, secret);
    }

    async fn start(&self) {
        let Some(generation) = self.authenticate().await else {
            return;
        };
        let ctx = PollContext {
            backend: self.backend.clone(),
            sessions: self.sessions.clone(),
            callback: self.callback.clone(),
            state: self.poll_state.clone(),
            generation,
            interval: self.poll_interval,
        };
        let handle = tokio::spawn(ingest::run_poll_loop(ctx));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Log in without spawning the poll loop, for one-shot sends.
    async fn connect(&self) {
        self.authenticate().await;
    }

    fn is_running(&self) -> bool {
        self.sessions.state() == ChannelState::Running
    }

    fn stop(&self) {
        self.sessions.stop();
        log::info!("bluesky: channel stopped");
    }

    async fn send(&self, group_id: &str, text: &str) -> Result<(), SendError> {
        let Some(session) = self.sessions.current() else {
            log::debug!("bluesky: send to {} skipped, channel not running", group_id);
            return Ok(());
        };
        let convo_id = native_conversation_id(GROUP_PREFIX, group_id)
            .ok_or_else(|| SendError::InvalidGroupId(group_id.to_string()))?;
        self.backend.send_message(&session, convo_id, text).await
    }

    /// Bluesky chat has no typing indicator; this is intentionally a no-op.
    fn set_typing(&self, _group_id: &str, _typing: bool) {}

    fn on_message(&self, callback: MessageCallback) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn is_configured(&self) -> bool {
        self.sessions.is_configured()
    }
}
