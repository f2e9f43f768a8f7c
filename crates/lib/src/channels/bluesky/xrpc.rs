//! Bluesky chat over XRPC: createSession/refreshSession on the PDS, chat.bsky.convo.* proxied to
//! the chat service.

use super::backend::{ChatBackend, LogBatch, Participant, Session};
use crate::channels::error::{AuthError, FetchError, SendError};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SERVICE: &str = "https://bsky.social";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PROXY_HEADER: &str = "atproto-proxy";
const CHAT_SERVICE_PROXY: &str = "did:web:api.bsky.chat#bsky_chat";
const LIST_CONVOS_PAGE_LIMIT: u32 = 100;
const LIST_CONVOS_MAX_PAGES: usize = 10;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    did: String,
    handle: String,
    access_jwt: String,
    refresh_jwt: String,
}

impl From<SessionResponse> for Session {
    fn from(r: SessionResponse) -> Self {
        Session {
            did: r.did,
            handle: r.handle,
            access_jwt: r.access_jwt,
            refresh_jwt: r.refresh_jwt,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetLogResponse {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    logs: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ListConvosResponse {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    convos: Vec<ConvoView>,
}

#[derive(Debug, Deserialize)]
struct ConvoView {
    #[serde(default)]
    members: Vec<MemberView>,
}

#[derive(Debug, Deserialize)]
struct MemberView {
    #[serde(default)]
    did: Option<String>,
    #[serde(default)]
    handle: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A non-success XRPC response: status plus the `{error, message}` body when there is one.
#[derive(Debug)]
struct XrpcFailure {
    status: reqwest::StatusCode,
    error: Option<String>,
    message: String,
}

impl XrpcFailure {
    async fn from_response(res: reqwest::Response) -> Self {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        match serde_json::from_str::<XrpcErrorBody>(&body) {
            Ok(parsed) => Self {
                status,
                error: parsed.error,
                message: parsed.message.unwrap_or_default(),
            },
            Err(_) => Self {
                status,
                error: None,
                message: body,
            },
        }
    }

    fn is_expired_token(&self) -> bool {
        self.error.as_deref() == Some("ExpiredToken")
    }

    fn is_auth_rejection(&self) -> bool {
        self.status == reqwest::StatusCode::UNAUTHORIZED
            || matches!(
                self.error.as_deref(),
                Some(
                    "AuthenticationRequired"
                        | "AuthFactorTokenRequired"
                        | "AccountTakedown"
                        | "InvalidToken"
                        | "ExpiredToken"
                )
            )
    }
}

impl fmt::Display for XrpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(e) => write!(f, "{} {}: {}", self.status, e, self.message),
            None => write!(f, "{} {}", self.status, self.message),
        }
    }
}

/// HTTP backend for the Bluesky chat API.
#[derive(Clone)]
pub struct XrpcBackend {
    service: String,
    client: reqwest::Client,
}

impl XrpcBackend {
    /// `service` is the PDS / entryway base URL (default [`DEFAULT_SERVICE`]). Every request is
    /// bounded by `timeout` so a hung backend cannot stall the poll loop forever.
    pub fn new(service: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let service = service
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { service, client })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn url(&self, nsid: &str) -> String {
        format!("{}/xrpc/{}", self.service, nsid)
    }

    fn chat_get(&self, nsid: &str, session: &Session) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(nsid))
            .bearer_auth(&session.access_jwt)
            .header(PROXY_HEADER, CHAT_SERVICE_PROXY)
    }

    async fn decode_session(res: reqwest::Response) -> Result<Session, AuthError> {
        if !res.status().is_success() {
            let failure = XrpcFailure::from_response(res).await;
            if failure.is_auth_rejection() {
                return Err(AuthError::Rejected(failure.to_string()));
            }
            return Err(AuthError::Api(failure.to_string()));
        }
        let data: SessionResponse = res
            .json()
            .await
            .map_err(|e| AuthError::Decode(e.to_string()))?;
        Ok(data.into())
    }
}

fn fetch_failure(failure: XrpcFailure) -> FetchError {
    if failure.is_expired_token() {
        FetchError::ExpiredToken
    } else {
        FetchError::Api(failure.to_string())
    }
}

#[async_trait]
impl ChatBackend for XrpcBackend {
    /// POST com.atproto.server.createSession
    async fn login(&self, identifier: &str, password: &str) -> Result<Session, AuthError> {
        let body = serde_json::json!({ "identifier": identifier, "password": password });
        let res = self
            .client
            .post(self.url("com.atproto.server.createSession"))
            .json(&body)
            .send()
            .await?;
        Self::decode_session(res).await
    }

    /// POST com.atproto.server.refreshSession, authorized with the refresh token.
    async fn refresh_session(&self, session: &Session) -> Result<Session, AuthError> {
        let res = self
            .client
            .post(self.url("com.atproto.server.refreshSession"))
            .bearer_auth(&session.refresh_jwt)
            .send()
            .await?;
        Self::decode_session(res).await
    }

    /// GET chat.bsky.convo.getLog
    async fn get_log(
        &self,
        session: &Session,
        cursor: Option<&str>,
    ) -> Result<LogBatch, FetchError> {
        let mut req = self.chat_get("chat.bsky.convo.getLog", session);
        if let Some(c) = cursor {
            req = req.query(&[("cursor", c)]);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(fetch_failure(XrpcFailure::from_response(res).await));
        }
        let data: GetLogResponse = res
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        Ok(LogBatch {
            cursor: data.cursor,
            logs: data.logs,
        })
    }

    /// GET chat.bsky.convo.listConvos, following the cursor for a bounded number of pages.
    async fn list_convos(&self, session: &Session) -> Result<Vec<Participant>, FetchError> {
        let mut participants = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..LIST_CONVOS_MAX_PAGES {
            let mut req = self
                .chat_get("chat.bsky.convo.listConvos", session)
                .query(&[("limit", LIST_CONVOS_PAGE_LIMIT.to_string())]);
            if let Some(c) = &cursor {
                req = req.query(&[("cursor", c)]);
            }
            let res = req.send().await?;
            if !res.status().is_success() {
                return Err(fetch_failure(XrpcFailure::from_response(res).await));
            }
            let page: ListConvosResponse = res
                .json()
                .await
                .map_err(|e| FetchError::Decode(e.to_string()))?;
            participants.extend(page.convos.into_iter().flat_map(|c| {
                c.members.into_iter().map(|m| Participant {
                    did: m.did,
                    handle: m.handle,
                })
            }));
            match page.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(participants)
    }

    /// POST chat.bsky.convo.sendMessage
    async fn send_message(
        &self,
        session: &Session,
        convo_id: &str,
        text: &str,
    ) -> Result<(), SendError> {
        let body = serde_json::json!({
            "convoId": convo_id,
            "message": { "text": text },
        });
        let res = self
            .client
            .post(self.url("chat.bsky.convo.sendMessage"))
            .bearer_auth(&session.access_jwt)
            .header(PROXY_HEADER, CHAT_SERVICE_PROXY)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let failure = XrpcFailure::from_response(res).await;
            return Err(SendError::Api(failure.to_string()));
        }
        Ok(())
    }
}
