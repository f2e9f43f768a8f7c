//! Scripted in-memory backend for unit tests.

use super::backend::{ChatBackend, LogBatch, Participant, Session};
use crate::channels::error::{AuthError, FetchError, SendError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn session(did: &str) -> Session {
    Session {
        did: did.to_string(),
        handle: "me.bsky.social".to_string(),
        access_jwt: "access-1".to_string(),
        refresh_jwt: "refresh-1".to_string(),
    }
}

/// A `logCreateMessage` entry wrapping a text `messageView`.
pub fn message_created(convo_id: &str, id: &str, sender_did: &str, text: &str) -> Value {
    json!({
        "$type": "chat.bsky.convo.defs#logCreateMessage",
        "rev": "r1",
        "convoId": convo_id,
        "message": {
            "$type": "chat.bsky.convo.defs#messageView",
            "id": id,
            "rev": "r1",
            "text": text,
            "sender": { "did": sender_did },
            "sentAt": "2024-05-01T12:00:00.000Z",
        },
    })
}

pub fn batch(cursor: Option<&str>, logs: Vec<Value>) -> LogBatch {
    LogBatch {
        cursor: cursor.map(str::to_string),
        logs,
    }
}

pub struct FakeBackend {
    did: String,
    logs: Mutex<VecDeque<Result<LogBatch, FetchError>>>,
    cursors: Mutex<Vec<Option<String>>>,
    participants: Mutex<Vec<Participant>>,
    sent: Mutex<Vec<(String, String)>>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    fetches_started: AtomicUsize,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    list_calls: AtomicUsize,
    fail_login: AtomicBool,
    fail_refresh: AtomicBool,
    fail_list: AtomicBool,
    fail_send: AtomicBool,
}

impl FakeBackend {
    pub fn new(did: &str) -> Self {
        Self {
            did: did.to_string(),
            logs: Mutex::new(VecDeque::new()),
            cursors: Mutex::new(Vec::new()),
            participants: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            fetch_gate: Mutex::new(None),
            fetches_started: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            fail_login: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
        }
    }

    /// Queue the result of the next `get_log`. An empty queue yields an empty batch without cursor.
    pub fn push_log(&self, result: Result<LogBatch, FetchError>) {
        self.logs.lock().unwrap().push_back(result);
    }

    pub fn set_participants(&self, participants: Vec<(&str, &str)>) {
        *self.participants.lock().unwrap() = participants
            .into_iter()
            .map(|(did, handle)| Participant {
                did: Some(did.to_string()),
                handle: Some(handle.to_string()),
            })
            .collect();
    }

    /// Make every `get_log` wait until the returned gate is notified.
    pub fn gate_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.fetch_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_login(&self) {
        self.fail_login.store(true, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self) {
        self.fail_refresh.store(true, Ordering::SeqCst);
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    pub fn fail_send(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    /// Cursor argument of every `get_log` call so far.
    pub fn cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fetches_started(&self) -> usize {
        self.fetches_started.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn login(&self, _identifier: &str, _password: &str) -> Result<Session, AuthError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(AuthError::Rejected("invalid identifier or password".to_string()));
        }
        Ok(session(&self.did))
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(AuthError::Rejected("refresh token expired".to_string()));
        }
        Ok(Session {
            access_jwt: "access-refreshed".to_string(),
            ..session.clone()
        })
    }

    async fn get_log(
        &self,
        _session: &Session,
        cursor: Option<&str>,
    ) -> Result<LogBatch, FetchError> {
        self.cursors.lock().unwrap().push(cursor.map(str::to_string));
        self.fetches_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.fetch_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.logs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(LogBatch::default()))
    }

    async fn list_convos(&self, _session: &Session) -> Result<Vec<Participant>, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(FetchError::Api("503 Service Unavailable".to_string()));
        }
        Ok(self.participants.lock().unwrap().clone())
    }

    async fn send_message(
        &self,
        _session: &Session,
        convo_id: &str,
        text: &str,
    ) -> Result<(), SendError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(SendError::Api("400 InvalidConvo".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((convo_id.to_string(), text.to_string()));
        Ok(())
    }
}
