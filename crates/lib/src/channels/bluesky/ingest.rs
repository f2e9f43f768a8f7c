//! Poll loop: refresh identities, read the next log batch, filter our own echoes, and hand
//! normalized messages to the registered callback. One task per channel run.
//!
//! Failures inside a tick are logged and the loop carries on after the interval; the cursor is
//! never cleared. A fetch that fails because the channel was stopped meanwhile ends the loop
//! quietly.

use super::backend::ChatBackend;
use super::identity::IdentityCache;
use super::log_reader::{CreatedMessage, LogReader};
use super::session::SessionManager;
use super::{CHANNEL_ID, GROUP_PREFIX};
use crate::channels::error::FetchError;
use crate::channels::inbound::{self, InboundMessage, MessageCallback};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// State owned by whichever loop currently holds it. Survives stop/start within the process.
#[derive(Debug, Default)]
pub(crate) struct PollState {
    pub reader: LogReader,
    pub identities: IdentityCache,
}

pub(crate) type CallbackSlot = Arc<RwLock<Option<MessageCallback>>>;

pub(crate) struct PollContext {
    pub backend: Arc<dyn ChatBackend>,
    pub sessions: Arc<SessionManager>,
    pub callback: CallbackSlot,
    pub state: Arc<tokio::sync::Mutex<PollState>>,
    pub generation: u64,
    pub interval: Duration,
}

impl PollContext {
    fn running(&self) -> bool {
        self.sessions.is_current(self.generation)
    }

    fn callback(&self) -> Option<MessageCallback> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn timestamp_millis(sent_at: Option<&str>) -> i64 {
    sent_at
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
}

pub(crate) fn to_inbound(m: CreatedMessage, identities: &IdentityCache) -> InboundMessage {
    InboundMessage {
        sender: identities.resolve(&m.sender_did).to_string(),
        group_id: inbound::group_id(GROUP_PREFIX, &m.convo_id),
        content: inbound::content_or_placeholder(m.text.as_deref()),
        timestamp: timestamp_millis(m.sent_at.as_deref()),
        channel: CHANNEL_ID.to_string(),
        id: m.id,
    }
}

/// One tick. Returns how many messages reached the callback.
pub(crate) async fn poll_once(
    ctx: &PollContext,
    state: &mut PollState,
) -> Result<usize, FetchError> {
    let Some(session) = ctx.sessions.session_for(ctx.generation) else {
        return Ok(0);
    };
    state.identities.refresh(ctx.backend.as_ref(), &session).await;
    let messages = state.reader.next_batch(ctx.backend.as_ref(), &session).await?;

    let mut delivered = 0;
    for m in messages {
        if m.sender_did == session.did {
            continue;
        }
        if !ctx.running() {
            break;
        }
        let msg = to_inbound(m, &state.identities);
        match ctx.callback() {
            Some(cb) => {
                cb(msg);
                delivered += 1;
            }
            None => log::debug!("bluesky: no message callback registered, dropping {}", msg.id),
        }
    }
    Ok(delivered)
}

pub(crate) async fn run_poll_loop(ctx: PollContext) {
    // Held for the whole run: a loop from a previous run must finish before this one proceeds.
    let mut state = ctx.state.lock().await;
    log::info!(
        "bluesky: poll loop started (every {} ms)",
        ctx.interval.as_millis()
    );
    while ctx.running() {
        match poll_once(&ctx, &mut state).await {
            Ok(0) => {}
            Ok(n) => log::debug!(
                "bluesky: delivered {} message(s), cursor {:?}",
                n,
                state.reader.cursor()
            ),
            Err(_) if !ctx.running() => {
                log::debug!("bluesky: channel stopped during fetch");
                break;
            }
            Err(FetchError::ExpiredToken) => {
                log::info!("bluesky: access token expired, renewing session");
                if let Err(e) = ctx
                    .sessions
                    .recover(ctx.backend.as_ref(), ctx.generation)
                    .await
                {
                    log::warn!("bluesky: session renewal failed: {}", e);
                }
            }
            Err(e) => log::warn!("bluesky: poll failed: {}", e),
        }
        if !ctx.running() {
            break;
        }
        tokio::time::sleep(ctx.interval).await;
    }
    log::info!("bluesky: poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::bluesky::fake::{batch, message_created, FakeBackend};
    use crate::channels::bluesky::ChannelState;
    use std::sync::Mutex;

    struct Harness {
        backend: Arc<FakeBackend>,
        ctx: PollContext,
        received: Arc<Mutex<Vec<InboundMessage>>>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::new("did:plc:me"));
        let sessions = Arc::new(SessionManager::new());
        sessions.configure("me.bsky.social", "app-pass");
        let attempt = sessions.begin_login().unwrap();
        let generation = sessions
            .finish_login(attempt.generation, Ok(crate::channels::bluesky::fake::session("did:plc:me")))
            .unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let cb: MessageCallback = Arc::new(move |m: InboundMessage| sink.lock().unwrap().push(m));
        let ctx = PollContext {
            backend: backend.clone(),
            sessions,
            callback: Arc::new(RwLock::new(Some(cb))),
            state: Arc::new(tokio::sync::Mutex::new(PollState::default())),
            generation,
            interval: Duration::from_millis(5),
        };
        Harness {
            backend,
            ctx,
            received,
        }
    }

    #[tokio::test]
    async fn own_messages_are_filtered() {
        let h = harness();
        h.backend.push_log(Ok(batch(
            Some("c1"),
            vec![message_created("convo", "m1", "did:plc:me", "echo")],
        )));
        let mut state = PollState::default();
        let n = poll_once(&h.ctx, &mut state).await.unwrap();
        assert_eq!(n, 0);
        assert!(h.received.lock().unwrap().is_empty());
        assert_eq!(state.reader.cursor(), Some("c1"));
    }

    #[tokio::test]
    async fn non_message_events_never_reach_the_callback() {
        let h = harness();
        h.backend.push_log(Ok(batch(
            Some("c1"),
            vec![
                serde_json::json!({ "$type": "chat.bsky.convo.defs#logReadMessage", "convoId": "x" }),
                serde_json::json!({ "$type": "chat.bsky.convo.defs#logLeaveConvo", "convoId": "x" }),
            ],
        )));
        let mut state = PollState::default();
        assert_eq!(poll_once(&h.ctx, &mut state).await.unwrap(), 0);
        assert!(h.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_are_normalized_in_batch_order() {
        let h = harness();
        h.backend
            .set_participants(vec![("did:plc:bob", "bob.bsky.social")]);
        h.backend.push_log(Ok(batch(
            Some("c1"),
            vec![
                message_created("convo1", "m1", "did:plc:bob", "hello"),
                message_created("convo1", "m2", "did:plc:me", "ignored"),
                message_created("convo2", "m3", "did:plc:carol", ""),
            ],
        )));
        let mut state = PollState::default();
        assert_eq!(poll_once(&h.ctx, &mut state).await.unwrap(), 2);

        let got = h.received.lock().unwrap().clone();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, "m1");
        assert_eq!(got[0].group_id, "bsky:convo1");
        assert_eq!(got[0].sender, "bob.bsky.social");
        assert_eq!(got[0].content, "hello");
        assert_eq!(got[0].channel, "bluesky");
        assert_eq!(got[0].timestamp, 1_714_564_800_000);
        assert_eq!(got[1].id, "m3");
        assert_eq!(got[1].sender, "did:plc:carol");
        assert_eq!(got[1].content, inbound::NON_TEXT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn identity_refresh_failure_does_not_block_delivery() {
        let h = harness();
        h.backend.fail_list();
        h.backend.push_log(Ok(batch(
            Some("c1"),
            vec![message_created("convo1", "m1", "did:plc:bob", "hello")],
        )));
        let mut state = PollState::default();
        assert_eq!(poll_once(&h.ctx, &mut state).await.unwrap(), 1);
        assert_eq!(h.received.lock().unwrap()[0].sender, "did:plc:bob");
    }

    #[tokio::test]
    async fn fetch_error_keeps_cursor_and_delivers_nothing() {
        let h = harness();
        h.backend.push_log(Ok(batch(Some("c1"), vec![])));
        h.backend
            .push_log(Err(FetchError::Api("503 Service Unavailable".to_string())));
        let mut state = PollState::default();
        poll_once(&h.ctx, &mut state).await.unwrap();
        assert!(poll_once(&h.ctx, &mut state).await.is_err());
        assert_eq!(state.reader.cursor(), Some("c1"));
        assert!(h.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unparseable_sent_at_falls_back_to_now() {
        let before = chrono::Utc::now().timestamp_millis();
        let ts = timestamp_millis(Some("yesterday"));
        assert!(ts >= before);
        assert_eq!(timestamp_millis(Some("1970-01-01T00:00:01Z")), 1000);
    }

    #[tokio::test]
    async fn loop_survives_errors_and_uses_stored_cursor() {
        let h = harness();
        h.backend.push_log(Ok(batch(Some("c1"), vec![])));
        h.backend
            .push_log(Err(FetchError::Api("502 Bad Gateway".to_string())));
        h.backend.push_log(Ok(batch(
            Some("c2"),
            vec![message_created("convo1", "m1", "did:plc:bob", "after error")],
        )));
        let sessions = h.ctx.sessions.clone();
        let task = tokio::spawn(run_poll_loop(h.ctx));
        for _ in 0..200 {
            if !h.received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sessions.stop();
        task.await.unwrap();

        assert_eq!(h.received.lock().unwrap()[0].content, "after error");
        let cursors = h.backend.cursors();
        assert_eq!(cursors[0], None);
        assert_eq!(cursors[1].as_deref(), Some("c1"));
        assert_eq!(cursors[2].as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn expired_token_triggers_session_renewal() {
        let h = harness();
        h.backend.push_log(Err(FetchError::ExpiredToken));
        let sessions = h.ctx.sessions.clone();
        let backend = h.backend.clone();
        let task = tokio::spawn(run_poll_loop(h.ctx));
        for _ in 0..200 {
            if backend.refresh_calls() > 0 && backend.fetches_started() > 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sessions.current().unwrap().access_jwt, "access-refreshed");
        sessions.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_renewal_keeps_polling_from_the_same_cursor() {
        let h = harness();
        h.backend.fail_refresh();
        h.backend.fail_login();
        h.backend.push_log(Ok(batch(Some("c1"), vec![])));
        h.backend.push_log(Err(FetchError::ExpiredToken));
        h.backend.push_log(Ok(batch(
            Some("c2"),
            vec![message_created("convo1", "m1", "did:plc:bob", "still here")],
        )));
        let sessions = h.ctx.sessions.clone();
        let backend = h.backend.clone();
        let task = tokio::spawn(run_poll_loop(h.ctx));
        for _ in 0..200 {
            if !h.received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sessions.state(), ChannelState::Running);
        sessions.stop();
        task.await.unwrap();

        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(backend.login_calls(), 1);
        assert_eq!(h.received.lock().unwrap()[0].content, "still here");
        let cursors = backend.cursors();
        assert_eq!(cursors[1].as_deref(), Some("c1"));
        assert_eq!(cursors[2].as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn stop_during_in_flight_fetch_ends_loop_without_delivery() {
        let h = harness();
        let gate = h.backend.gate_fetches();
        h.backend.push_log(Ok(batch(
            Some("c1"),
            vec![message_created("convo1", "m1", "did:plc:bob", "late")],
        )));
        let sessions = h.ctx.sessions.clone();
        let backend = h.backend.clone();
        let task = tokio::spawn(run_poll_loop(h.ctx));
        for _ in 0..200 {
            if backend.fetches_started() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sessions.stop();
        gate.notify_one();
        task.await.unwrap();
        assert!(h.received.lock().unwrap().is_empty());
        assert_eq!(backend.fetches_started(), 1);
    }
}
