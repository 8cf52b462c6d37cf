//! Session registry.
//!
//! Tracks which usernames hold a live session. A session that misses its
//! heartbeat window is moved to the inactive pool rather than dropped, so the
//! player can re-attach later and find their lobby and match untouched.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

/// Default heartbeat timeout (45 seconds).
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

/// Session registry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,

    /// Missed heartbeats or closed by the transport; may re-attach
    Inactive { since: Instant },
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Session of one authenticated username.
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub status: SessionStatus,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,

    /// Lobby the player belongs to, kept across re-attach
    pub lobby: Option<String>,
}

impl Session {
    pub fn new(username: String, now: Instant) -> Self {
        Self {
            username,
            status: SessionStatus::Active,
            connected_at: now,
            last_heartbeat: now,
            lobby: None,
        }
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.status.is_active() && now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

/// How a connect request was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attach {
    /// First session for this username
    Fresh,
    /// An inactive session was restored
    Reattached { lobby: Option<String> },
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{0} already has an active session")]
    AlreadyConnected(String),
    #[error("no session for {0}")]
    NotFound(String),
    #[error("session of {0} is inactive")]
    Inactive(String),
}

/// Session manager - username to session.
#[derive(Debug, Default)]
pub struct SessionManager {
    config: SessionConfig,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session, restoring an inactive one for the same username.
    pub fn connect(&mut self, username: &str, now: Instant) -> Result<Attach, SessionError> {
        if let Some(session) = self.sessions.get_mut(username) {
            if session.status.is_active() {
                return Err(SessionError::AlreadyConnected(username.to_string()));
            }
            session.status = SessionStatus::Active;
            session.last_heartbeat = now;
            info!(username, lobby = ?session.lobby, "session re-attached");
            return Ok(Attach::Reattached {
                lobby: session.lobby.clone(),
            });
        }
        self.sessions
            .insert(username.to_string(), Session::new(username.to_string(), now));
        info!(username, "session opened");
        Ok(Attach::Fresh)
    }

    pub fn heartbeat(&mut self, username: &str, now: Instant) -> Result<(), SessionError> {
        let session = self.get_active_mut(username)?;
        session.last_heartbeat = now;
        Ok(())
    }

    /// Move a session to the inactive pool.
    pub fn disconnect(&mut self, username: &str, now: Instant) -> Result<(), SessionError> {
        let session = self.get_active_mut(username)?;
        session.status = SessionStatus::Inactive { since: now };
        info!(username, "session disconnected");
        Ok(())
    }

    /// Deactivate sessions whose heartbeat window has passed.
    /// Returns the affected usernames.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.config.heartbeat_timeout;
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            if session.is_timed_out(now, timeout) {
                session.status = SessionStatus::Inactive { since: now };
                expired.push(session.username.clone());
            }
        }
        expired.sort();
        if !expired.is_empty() {
            info!(?expired, "sessions timed out");
        }
        expired
    }

    /// Record the lobby a player belongs to.
    pub fn bind_lobby(
        &mut self,
        username: &str,
        lobby: Option<String>,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(username)
            .ok_or_else(|| SessionError::NotFound(username.to_string()))?;
        session.lobby = lobby;
        Ok(())
    }

    /// Forget a session entirely.
    pub fn remove(&mut self, username: &str) -> Option<Session> {
        self.sessions.remove(username)
    }

    pub fn get(&self, username: &str) -> Option<&Session> {
        self.sessions.get(username)
    }

    pub fn is_active(&self, username: &str) -> bool {
        self.sessions
            .get(username)
            .is_some_and(|s| s.status.is_active())
    }

    /// Fail unless `username` holds an active session.
    pub fn require_active(&self, username: &str) -> Result<&Session, SessionError> {
        let session = self
            .sessions
            .get(username)
            .ok_or_else(|| SessionError::NotFound(username.to_string()))?;
        if !session.status.is_active() {
            return Err(SessionError::Inactive(username.to_string()));
        }
        Ok(session)
    }

    fn get_active_mut(&mut self, username: &str) -> Result<&mut Session, SessionError> {
        let session = self
            .sessions
            .get_mut(username)
            .ok_or_else(|| SessionError::NotFound(username.to_string()))?;
        if !session.status.is_active() {
            return Err(SessionError::Inactive(username.to_string()));
        }
        Ok(session)
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.status.is_active())
            .count()
    }

    pub fn inactive_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.status.is_active())
            .map(|s| s.username.clone())
            .collect();
        names.sort();
        names
    }

    pub fn total_count(&self) -> usize {
        self.sessions.len()
    }
}
