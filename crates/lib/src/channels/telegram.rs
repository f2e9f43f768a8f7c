//! Telegram channel: long-poll getUpdates and sendMessage via Bot API.
//!
//! Group ids are `tg:<chat_id>`; message ids are `<chat_id>:<message_id>` since Telegram
//! message ids are only unique within a chat.

use crate::channels::error::SendError;
use crate::channels::inbound::{self, InboundMessage, MessageCallback};
use crate::channels::registry::Channel;
use crate::config::{self, Config};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const CHANNEL_ID: &str = "telegram";
pub const GROUP_PREFIX: &str = "tg";

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    /// Unix time in seconds.
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.first_name.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Next getUpdates offset: one past the highest update id, or `None` for an empty batch.
pub fn next_offset(updates: &[TelegramUpdate]) -> Option<i64> {
    updates.iter().map(|u| u.update_id).max().map(|id| id + 1)
}

/// Normalize one update. `None` for non-message updates and for messages the bot sent itself.
pub fn update_to_inbound(update: &TelegramUpdate, bot_id: i64) -> Option<InboundMessage> {
    let msg = update.message.as_ref()?;
    if msg.from.as_ref().map(|u| u.id) == Some(bot_id) {
        return None;
    }
    let chat_id = msg.chat.id.to_string();
    Some(InboundMessage {
        id: format!("{}:{}", chat_id, msg.message_id),
        group_id: inbound::group_id(GROUP_PREFIX, &chat_id),
        sender: msg
            .from
            .as_ref()
            .map(TelegramUser::display_name)
            .unwrap_or_else(|| chat_id.clone()),
        content: inbound::content_or_placeholder(msg.text.as_deref()),
        timestamp: msg.date * 1000,
        channel: CHANNEL_ID.to_string(),
    })
}

/// A started run: the token it was started with and its active flag.
struct Run {
    active: Arc<AtomicBool>,
    token: String,
}

/// State shared between the channel and its getUpdates loop.
struct Shared {
    api_base: String,
    client: reqwest::Client,
    request_timeout: Duration,
    callback: RwLock<Option<MessageCallback>>,
}

impl Shared {
    fn url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        method: &str,
    ) -> Result<T, String> {
        let res = req.send().await.map_err(|e| e.to_string())?;
        let status = res.status();
        let body = res.text().await.map_err(|e| e.to_string())?;
        let data: ApiResponse<T> = serde_json::from_str(&body)
            .map_err(|e| format!("{} failed: {} {}: {}", method, status, e, body))?;
        if !data.ok {
            return Err(format!(
                "{} failed: {} {}",
                method,
                status,
                data.description.unwrap_or_default()
            ));
        }
        data.result
            .ok_or_else(|| format!("{} returned no result", method))
    }

    async fn get_me(&self, token: &str) -> Result<TelegramUser, String> {
        let req = self.client.get(self.url(token, "getMe"));
        self.call(req, "getMe").await
    }

    /// Call Telegram getUpdates (long poll). Returns the updates; the caller owns the offset.
    async fn get_updates(
        &self,
        token: &str,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>, String> {
        let mut req = self
            .client
            .get(self.url(token, "getUpdates"))
            .query(&[("timeout", LONG_POLL_TIMEOUT)])
            .timeout(self.request_timeout + Duration::from_secs(LONG_POLL_TIMEOUT));
        if let Some(off) = offset {
            req = req.query(&[("offset", off)]);
        }
        self.call(req, "getUpdates").await
    }

    async fn send_message(&self, token: &str, chat_id: &str, text: &str) -> Result<(), String> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let req = self.client.post(self.url(token, "sendMessage")).json(&body);
        self.call::<serde_json::Value>(req, "sendMessage").await?;
        Ok(())
    }

    async fn send_chat_action(&self, token: &str, chat_id: &str) -> Result<(), String> {
        let body = serde_json::json!({ "chat_id": chat_id, "action": "typing" });
        let req = self.client.post(self.url(token, "sendChatAction")).json(&body);
        self.call::<bool>(req, "sendChatAction").await?;
        Ok(())
    }

    fn deliver(&self, msg: InboundMessage) -> bool {
        let cb = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match cb {
            Some(cb) => {
                cb(msg);
                true
            }
            None => {
                log::debug!("telegram: no message callback registered, dropping {}", msg.id);
                false
            }
        }
    }
}

/// Telegram channel connector: long-polls for updates and sends replies via sendMessage.
pub struct TelegramChannel {
    shared: Arc<Shared>,
    token: Mutex<String>,
    run: Mutex<Option<Run>>,
    /// Bumped by every `stop`, so a `start` that was waiting on getMe can tell it was cancelled.
    generation: AtomicU64,
    offset: Arc<tokio::sync::Mutex<Option<i64>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelegramChannel {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_api_base(telegram_api_base(), request_timeout)
    }

    pub fn with_api_base(api_base: String, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                api_base: api_base.trim_end_matches('/').to_string(),
                client,
                request_timeout,
                callback: RwLock::new(None),
            }),
            token: Mutex::new(String::new()),
            run: Mutex::new(None),
            generation: AtomicU64::new(0),
            offset: Arc::new(tokio::sync::Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build from config; the bot token comes from env or config when present.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let channel = Self::new(config.channels.telegram.request_timeout())?;
        if let Some(token) = config::resolve_telegram_token(config) {
            channel.configure("", &token);
        }
        Ok(channel)
    }

    fn running_token(&self) -> Option<String> {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.token.clone())
    }

    /// Wait for every getUpdates loop spawned so far to exit. Call after `stop`.
    pub async fn join(&self) {
        let handles =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("telegram: getUpdates task ended abnormally: {}", e);
            }
        }
    }

    /// Check the token with getMe and install a run. `None` when unconfigured, already
    /// running, the token was rejected, or `stop` was called while getMe was in flight.
    async fn open_run(&self) -> Option<(Arc<AtomicBool>, String, i64)> {
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if token.is_empty() || self.is_running() {
            return None;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let me = match self.shared.get_me(&token).await {
            Ok(me) => me,
            Err(e) => {
                log::error!("telegram: bot token rejected: {}", e);
                return None;
            }
        };
        let active = Arc::new(AtomicBool::new(true));
        {
            let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
            if self.generation.load(Ordering::SeqCst) != generation {
                log::debug!("telegram: stopped while connecting, not starting");
                return None;
            }
            if run.is_some() {
                return None;
            }
            *run = Some(Run {
                active: active.clone(),
                token: token.clone(),
            });
        }
        log::info!("telegram: connected as @{}", me.display_name());
        Some((active, token, me.id))
    }
}

async fn run_get_updates_loop(
    shared: Arc<Shared>,
    offset: Arc<tokio::sync::Mutex<Option<i64>>>,
    active: Arc<AtomicBool>,
    token: String,
    bot_id: i64,
) {
    let mut offset = offset.lock().await;
    log::info!("telegram channel: starting getUpdates long-poll loop");
    while active.load(Ordering::SeqCst) {
        match shared.get_updates(&token, *offset).await {
            Ok(updates) => {
                if let Some(next) = next_offset(&updates) {
                    *offset = Some(next);
                }
                for u in &updates {
                    if !active.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Some(msg) = update_to_inbound(u, bot_id) {
                        shared.deliver(msg);
                    }
                }
            }
            Err(_) if !active.load(Ordering::SeqCst) => break,
            Err(e) => {
                log::warn!("telegram getUpdates error: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl Channel for TelegramChannel {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn prefix(&self) -> &str {
        GROUP_PREFIX
    }

    /// Telegram bots authenticate with the token alone; `identifier` is ignored.
    fn configure(&self, _identifier: &str, secret: &str) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = secret.trim().to_string();
    }

    async fn start(&self) {
        let Some((active, token, bot_id)) = self.open_run().await else {
            return;
        };
        let handle = tokio::spawn(run_get_updates_loop(
            self.shared.clone(),
            self.offset.clone(),
            active,
            token,
            bot_id,
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Check the token without polling, so pending updates stay unconfirmed for the next
    /// `start`.
    async fn connect(&self) {
        self.open_run().await;
    }

    fn is_running(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn stop(&self) {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(run) = run.take() {
            run.active.store(false, Ordering::SeqCst);
            log::info!("telegram: channel stopped");
        }
    }

    async fn send(&self, group_id: &str, text: &str) -> Result<(), SendError> {
        let Some(token) = self.running_token() else {
            log::debug!("telegram: send to {} skipped, channel not running", group_id);
            return Ok(());
        };
        let chat_id = inbound::native_conversation_id(GROUP_PREFIX, group_id)
            .ok_or_else(|| SendError::InvalidGroupId(group_id.to_string()))?;
        self.shared
            .send_message(&token, chat_id, text)
            .await
            .map_err(SendError::Api)
    }

    /// Sends a `typing` chat action in the background. Telegram clears it on its own, so
    /// `typing == false` does nothing.
    fn set_typing(&self, group_id: &str, typing: bool) {
        if !typing {
            return;
        }
        let Some(token) = self.running_token() else {
            return;
        };
        let Some(chat_id) = inbound::native_conversation_id(GROUP_PREFIX, group_id) else {
            return;
        };
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            log::debug!("telegram: set_typing outside a runtime, skipping");
            return;
        };
        let shared = self.shared.clone();
        let chat_id = chat_id.to_string();
        rt.spawn(async move {
            if let Err(e) = shared.send_chat_action(&token, &chat_id).await {
                log::debug!("telegram: sendChatAction failed: {}", e);
            }
        });
    }

    fn on_message(&self, callback: MessageCallback) {
        *self
            .shared
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn is_configured(&self) -> bool {
        !self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Resolve Telegram bot API base URL (for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}
