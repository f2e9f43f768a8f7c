//! Credentials, login state, and the authenticated session.
//!
//! State machine: `Unconfigured -> Configured -> Authenticating -> Running -> Stopped`.
//! A failed login returns to `Configured` so `start` can be retried without re-entering
//! credentials. Each successful login opens a new run generation; `stop` closes it, and a poll
//! loop only acts while its own generation is current.

use super::backend::{ChatBackend, Session};
use crate::channels::error::AuthError;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lifecycle state of a channel, observable by the UI (e.g. "disconnected" after a failed login).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconfigured,
    Configured,
    Authenticating,
    Running,
    Stopped,
}

/// Credentials captured for one login attempt.
pub(crate) struct LoginAttempt {
    pub identifier: String,
    pub secret: String,
    pub generation: u64,
}

#[derive(Default)]
struct Inner {
    identifier: String,
    secret: String,
    state: Option<ChannelState>,
    generation: u64,
    session: Option<Session>,
}

impl Inner {
    fn is_configured(&self) -> bool {
        !self.identifier.is_empty() && !self.secret.is_empty()
    }

    fn state(&self) -> ChannelState {
        self.state.unwrap_or(if self.is_configured() {
            ChannelState::Configured
        } else {
            ChannelState::Unconfigured
        })
    }

    /// Not running and not logging in: fall back to the credential-derived state.
    fn settle(&mut self) {
        self.state = None;
        self.session = None;
    }
}

pub(crate) struct SessionManager {
    inner: Mutex<Inner>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store credentials. Does not touch a running session.
    pub fn configure(&self, identifier: &str, secret: &str) {
        let mut g = self.lock();
        g.identifier = identifier.trim().to_string();
        g.secret = secret.trim().to_string();
    }

    pub fn is_configured(&self) -> bool {
        self.lock().is_configured()
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state()
    }

    /// Move to `Authenticating` and hand out the credentials. `None` when already running or
    /// logging in, or when a credential is missing.
    pub fn begin_login(&self) -> Option<LoginAttempt> {
        let mut g = self.lock();
        if !g.is_configured() {
            return None;
        }
        if matches!(
            g.state(),
            ChannelState::Authenticating | ChannelState::Running
        ) {
            return None;
        }
        g.generation += 1;
        g.state = Some(ChannelState::Authenticating);
        Some(LoginAttempt {
            identifier: g.identifier.clone(),
            secret: g.secret.clone(),
            generation: g.generation,
        })
    }

    /// Complete a login attempt. Returns the run generation when the channel is now running.
    /// A result for an attempt that `stop` already superseded is discarded.
    pub fn finish_login(
        &self,
        attempt_generation: u64,
        result: Result<Session, AuthError>,
    ) -> Option<u64> {
        let mut g = self.lock();
        if g.generation != attempt_generation || g.state() != ChannelState::Authenticating {
            log::debug!("bluesky: login finished after stop, discarding session");
            return None;
        }
        match result {
            Ok(session) => {
                log::info!("bluesky: logged in as {} ({})", session.handle, session.did);
                g.session = Some(session);
                g.state = Some(ChannelState::Running);
                Some(g.generation)
            }
            Err(e) => {
                log::error!("bluesky: login failed: {}", e);
                g.settle();
                None
            }
        }
    }

    /// Stop unconditionally: close the current generation and drop the session.
    pub fn stop(&self) {
        let mut g = self.lock();
        g.generation += 1;
        g.session = None;
        g.state = Some(ChannelState::Stopped);
    }

    /// True while `generation` is the running generation.
    pub fn is_current(&self, generation: u64) -> bool {
        let g = self.lock();
        g.generation == generation && g.state() == ChannelState::Running
    }

    /// The running session, if any.
    pub fn current(&self) -> Option<Session> {
        let g = self.lock();
        if g.state() == ChannelState::Running {
            g.session.clone()
        } else {
            None
        }
    }

    /// The session of `generation`, if that generation is still running.
    pub fn session_for(&self, generation: u64) -> Option<Session> {
        let g = self.lock();
        if g.generation == generation && g.state() == ChannelState::Running {
            g.session.clone()
        } else {
            None
        }
    }

    /// Install a renewed session for `generation`. Ignored once that generation is gone.
    fn replace(&self, generation: u64, session: Session) -> bool {
        let mut g = self.lock();
        if g.generation == generation && g.state() == ChannelState::Running {
            g.session = Some(session);
            true
        } else {
            false
        }
    }

    /// Renew an expired session: refresh token first, then a fresh login with the stored
    /// credentials. The channel stays running either way; the next tick retries.
    pub async fn recover(
        &self,
        backend: &dyn ChatBackend,
        generation: u64,
    ) -> Result<(), AuthError> {
        let Some(session) = self.session_for(generation) else {
            return Ok(());
        };
        let renewed = match backend.refresh_session(&session).await {
            Ok(s) => s,
            Err(e) => {
                log::debug!("bluesky: session refresh failed, logging in again: {}", e);
                let (identifier, secret) = {
                    let g = self.lock();
                    (g.identifier.clone(), g.secret.clone())
                };
                backend.login(&identifier, &secret).await?
            }
        };
        if self.replace(generation, renewed) {
            log::info!("bluesky: session renewed");
        }
        Ok(())
    }
}
