//! Match controller.
//!
//! [`Server`] is the explicit context the wire layer calls into. Registries
//! sit behind coarse locks; every match has its own lock so commands of one
//! match run one at a time while different matches proceed in parallel.
//!
//! Lock order is sessions, lobbies, match registry, then a single match.
//! A match lock is never held while taking a registry lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::card::Card;
use super::component::Component;
use super::connection::{Attach, SessionConfig, SessionError, SessionManager};
use super::error::EngineError;
use super::event::EventCollector;
use super::game::{Command, Game, GameConfig};
use super::lobby::{LobbyError, LobbyManager};
use super::router::{route, DeliveryReport, Outbound, Transport};

/// Supplies the component pool and the card deck of a new match.
pub trait ContentSource {
    fn components(&self) -> Vec<Component>;
    fn cards(&self) -> Vec<Card>;
}

/// Controller errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{0} is not in a match")]
    NoMatch(String),
}

/// One running match and the players its events go to.
#[derive(Debug)]
pub struct Match {
    pub id: String,
    pub lobby_id: String,
    pub members: Vec<String>,
    game: Mutex<Game>,
}

impl Match {
    /// Run `f` with the match locked.
    pub fn with_game<T>(&self, f: impl FnOnce(&mut Game) -> T) -> T {
        f(&mut lock(&self.game))
    }
}

#[derive(Debug, Default)]
struct Matches {
    by_id: HashMap<String, Arc<Match>>,
    by_player: HashMap<String, String>,
}

pub struct Server {
    sessions: Mutex<SessionManager>,
    lobbies: Mutex<LobbyManager>,
    matches: Mutex<Matches>,
    transport: Arc<dyn Transport + Send + Sync>,
    content: Arc<dyn ContentSource + Send + Sync>,
    next_game: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Server {
    pub fn new(
        transport: Arc<dyn Transport + Send + Sync>,
        content: Arc<dyn ContentSource + Send + Sync>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(SessionManager::new(config)),
            lobbies: Mutex::new(LobbyManager::new()),
            matches: Mutex::new(Matches::default()),
            transport,
            content,
            next_game: AtomicU64::new(0),
        }
    }

    /// Open or re-attach a session. A player re-attaching to a running
    /// match receives a snapshot of it.
    pub fn connect(&self, username: &str, now: Instant) -> Result<Attach, ServerError> {
        let attach = lock(&self.sessions).connect(username, now)?;
        if matches!(attach, Attach::Reattached { .. }) {
            self.resync(username);
        }
        Ok(attach)
    }

    pub fn heartbeat(&self, username: &str, now: Instant) -> Result<(), ServerError> {
        lock(&self.sessions).heartbeat(username, now)?;
        Ok(())
    }

    /// The match keeps going without the player.
    pub fn disconnect(&self, username: &str, now: Instant) -> Result<(), ServerError> {
        lock(&self.sessions).disconnect(username, now)?;
        Ok(())
    }

    pub fn expire_stale(&self, now: Instant) -> Vec<String> {
        lock(&self.sessions).expire_stale(now)
    }

    pub fn is_active(&self, username: &str) -> bool {
        lock(&self.sessions).is_active(username)
    }

    pub fn create_lobby(&self, username: &str, config: GameConfig) -> Result<String, ServerError> {
        let mut sessions = lock(&self.sessions);
        sessions.require_active(username)?;
        let lobby_id = lock(&self.lobbies).create(username, config)?;
        sessions.bind_lobby(username, Some(lobby_id.clone()))?;
        Ok(lobby_id)
    }

    pub fn join_lobby(&self, username: &str, lobby_id: &str) -> Result<(), ServerError> {
        let mut sessions = lock(&self.sessions);
        sessions.require_active(username)?;
        lock(&self.lobbies).join(lobby_id, username)?;
        sessions.bind_lobby(username, Some(lobby_id.to_string()))?;
        Ok(())
    }

    pub fn leave_lobby(&self, username: &str) -> Result<(), ServerError> {
        let mut sessions = lock(&self.sessions);
        lock(&self.lobbies).leave(username)?;
        sessions.bind_lobby(username, None)?;
        Ok(())
    }

    pub fn set_ready(&self, username: &str, ready: bool) -> Result<(), ServerError> {
        lock(&self.lobbies).set_ready(username, ready)?;
        Ok(())
    }

    /// Start the match of a lobby whose members are all ready.
    pub fn start_match(&self, lobby_id: &str, now: DateTime<Utc>) -> Result<String, ServerError> {
        let mut lobbies = lock(&self.lobbies);
        let lobby = lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| LobbyError::NotFound(lobby_id.to_string()))?;
        if !lobby.can_start() {
            return Err(LobbyError::NotReady.into());
        }

        let game_id = format!("game-{}", self.next_game.fetch_add(1, Ordering::Relaxed) + 1);
        let members = lobby.usernames();
        let mut game = Game::new(
            game_id.clone(),
            lobby_id.to_string(),
            members.clone(),
            self.content.components(),
            self.content.cards(),
            lobby.config.clone(),
        )?;
        let mut events = EventCollector::new();
        game.start(now, &mut events)?;
        lobby.set_active_game(Some(game_id.clone()));

        let handle = Arc::new(Match {
            id: game_id.clone(),
            lobby_id: lobby_id.to_string(),
            members: members.clone(),
            game: Mutex::new(game),
        });
        {
            let mut matches = lock(&self.matches);
            for member in &members {
                matches.by_player.insert(member.clone(), game_id.clone());
            }
            matches.by_id.insert(game_id.clone(), Arc::clone(&handle));
        }
        drop(lobbies);

        handle.with_game(|_| route(&events.flush(), &handle.members, &*self.transport));
        info!(game = %game_id, lobby = %lobby_id, "match registered");
        Ok(game_id)
    }

    /// Handle for the match a player is in.
    pub fn match_of(&self, username: &str) -> Option<Arc<Match>> {
        let matches = lock(&self.matches);
        let game_id = matches.by_player.get(username)?;
        matches.by_id.get(game_id).cloned()
    }

    pub fn match_count(&self) -> usize {
        lock(&self.matches).by_id.len()
    }

    /// Apply a player command and deliver its events.
    ///
    /// A rejected command delivers nothing.
    pub fn handle(
        &self,
        username: &str,
        command: Command,
        now: DateTime<Utc>,
    ) -> Result<DeliveryReport, ServerError> {
        let handle = self
            .match_of(username)
            .ok_or_else(|| ServerError::NoMatch(username.to_string()))?;

        let (report, ended) = handle.with_game(|game| {
            let mut events = EventCollector::new();
            game.apply(username, command, now, &mut events)?;
            let report = route(&events.flush(), &handle.members, &*self.transport);
            Ok::<_, ServerError>((report, game.phase().is_terminal()))
        })?;

        if ended {
            self.close_match(&handle);
        }
        Ok(report)
    }

    /// Advance the timers of every match.
    pub fn tick(&self, now: DateTime<Utc>) {
        let handles: Vec<Arc<Match>> = lock(&self.matches).by_id.values().cloned().collect();
        for handle in handles {
            let ended = handle.with_game(|game| {
                let mut events = EventCollector::new();
                if let Err(e) = game.tick(now, &mut events) {
                    warn!(game = %game.id, error = %e, "tick failed");
                    return false;
                }
                route(&events.flush(), &handle.members, &*self.transport);
                game.phase().is_terminal()
            });
            if ended {
                self.close_match(&handle);
            }
        }
    }

    /// Send the player their view of the match they are in.
    pub fn resync(&self, username: &str) {
        let Some(handle) = self.match_of(username) else {
            return;
        };
        let view = handle.with_game(|game| game.snapshot().for_player(username));
        if let Err(e) = self
            .transport
            .send(username, &Outbound::Snapshot(Box::new(view)))
        {
            warn!(recipient = %username, error = %e, "snapshot not delivered");
        }
    }

    fn close_match(&self, handle: &Match) {
        if let Some(lobby) = lock(&self.lobbies).get_mut(&handle.lobby_id) {
            lobby.set_active_game(None);
        }
        let mut matches = lock(&self.matches);
        for member in &handle.members {
            matches.by_player.remove(member);
        }
        matches.by_id.remove(&handle.id);
        info!(game = %handle.id, lobby = %handle.lobby_id, "match closed");
    }
}
