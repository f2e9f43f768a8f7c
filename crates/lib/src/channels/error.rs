//! Channel error types, one per policy: auth and fetch failures are recovered inside the
//! adapters, send failures propagate to the caller.

/// Login or session refresh failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The backend refused the credentials or the refresh token.
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("auth request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("auth api error: {0}")]
    Api(String),
    #[error("auth response malformed: {0}")]
    Decode(String),
}

/// Fetching the event log or conversation list failed. Swallowed by the poll loop.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The access token expired; the session can be refreshed and the fetch retried.
    #[error("access token expired")]
    ExpiredToken,
    #[error("fetch api error: {0}")]
    Api(String),
    #[error("fetch response malformed: {0}")]
    Decode(String),
}

/// Sending a message failed. Always surfaced to the caller of `send`.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The group id does not carry this channel's prefix.
    #[error("group id {0:?} does not belong to this channel")]
    InvalidGroupId(String),
    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("send api error: {0}")]
    Api(String),
}
