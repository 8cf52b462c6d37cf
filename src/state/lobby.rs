//! Lobby directory.
//!
//! A lobby gathers the players of one match before it starts and keeps them
//! together while it runs. Join order becomes turn order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::info;

use super::game::{GameConfig, MAX_PLAYERS, MIN_PLAYERS};

/// Maximum players per lobby.
pub const MAX_LOBBY_PLAYERS: usize = MAX_PLAYERS;

/// A player's state within a lobby.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbyMember {
    pub username: String,

    /// Whether player is ready to start
    pub is_ready: bool,

    pub joined_at: DateTime<Utc>,
}

impl LobbyMember {
    pub fn new(username: String) -> Self {
        Self {
            username,
            is_ready: false,
            joined_at: Utc::now(),
        }
    }
}

/// Lobby state.
#[derive(Debug, Clone)]
pub struct Lobby {
    pub id: String,

    /// Members in join order
    members: Vec<LobbyMember>,

    pub host: Option<String>,

    /// Settings for the next match
    pub config: GameConfig,

    /// Active game ID (if any)
    pub active_game_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Lobby {
    pub fn new(id: String, config: GameConfig) -> Self {
        Self {
            id,
            members: Vec::new(),
            host: None,
            config,
            active_game_id: None,
            created_at: Utc::now(),
        }
    }

    /// Add a member to the lobby.
    pub fn add_member(&mut self, member: LobbyMember) -> Result<(), LobbyError> {
        if self.has_active_game() {
            return Err(LobbyError::GameInProgress);
        }
        if self.is_full() {
            return Err(LobbyError::Full);
        }
        if self.has_member(&member.username) {
            return Err(LobbyError::AlreadyInGame(member.username));
        }

        // First member becomes host
        if self.host.is_none() {
            self.host = Some(member.username.clone());
        }
        self.members.push(member);
        Ok(())
    }

    /// Remove a member from the lobby.
    pub fn remove_member(&mut self, username: &str) -> Option<LobbyMember> {
        let index = self.members.iter().position(|m| m.username == username)?;
        let member = self.members.remove(index);

        // If host left, the longest-standing member takes over
        if self.host.as_deref() == Some(username) {
            self.host = self.members.first().map(|m| m.username.clone());
        }
        Some(member)
    }

    pub fn get_member(&self, username: &str) -> Option<&LobbyMember> {
        self.members.iter().find(|m| m.username == username)
    }

    pub fn has_member(&self, username: &str) -> bool {
        self.get_member(username).is_some()
    }

    pub fn is_host(&self, username: &str) -> bool {
        self.host.as_deref() == Some(username)
    }

    /// Set player ready state.
    pub fn set_ready(&mut self, username: &str, ready: bool) -> Result<(), LobbyError> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.username == username)
            .ok_or(LobbyError::NotMember)?;
        member.is_ready = ready;
        Ok(())
    }

    pub fn members(&self) -> &[LobbyMember] {
        &self.members
    }

    /// Member usernames in join order.
    pub fn usernames(&self) -> Vec<String> {
        self.members.iter().map(|m| m.username.clone()).collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn ready_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_ready).count()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= MAX_LOBBY_PLAYERS
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn all_ready(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(|m| m.is_ready)
    }

    /// Enough ready players and no match running.
    pub fn can_start(&self) -> bool {
        (MIN_PLAYERS..=MAX_LOBBY_PLAYERS).contains(&self.members.len())
            && self.all_ready()
            && !self.has_active_game()
    }

    pub fn has_active_game(&self) -> bool {
        self.active_game_id.is_some()
    }

    /// Set the active game; clearing it resets every ready flag.
    pub fn set_active_game(&mut self, game_id: Option<String>) {
        if game_id.is_none() {
            for member in &mut self.members {
                member.is_ready = false;
            }
        }
        self.active_game_id = game_id;
    }

    /// Convert to JSON for sending to clients.
    pub fn to_json(&self) -> serde_json::Value {
        let members: Vec<serde_json::Value> = self
            .members
            .iter()
            .map(|m| {
                serde_json::json!({
                    "username": m.username,
                    "is_ready": m.is_ready,
                })
            })
            .collect();

        serde_json::json!({
            "lobby_id": self.id,
            "players": members,
            "host": self.host,
            "mode": self.config.mode.as_str(),
            "max_players": MAX_LOBBY_PLAYERS,
            "active_game_id": self.active_game_id
        })
    }
}

/// Lobby errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("{0} is already in a lobby")]
    AlreadyInGame(String),
    #[error("lobby {0} not found")]
    NotFound(String),
    #[error("Lobby is full")]
    Full,
    #[error("Not a member of this lobby")]
    NotMember,
    #[error("A game is in progress")]
    GameInProgress,
    #[error("Lobby is not ready to start")]
    NotReady,
}

/// Lobby manager - tracks all lobbies.
#[derive(Debug, Default)]
pub struct LobbyManager {
    /// Lobbies by ID
    lobbies: HashMap<String, Lobby>,

    /// Username to lobby ID mapping
    player_index: HashMap<String, String>,

    next_id: u64,
}

impl LobbyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a lobby with `host` as its first member.
    pub fn create(&mut self, host: &str, config: GameConfig) -> Result<String, LobbyError> {
        if self.player_index.contains_key(host) {
            return Err(LobbyError::AlreadyInGame(host.to_string()));
        }
        self.next_id += 1;
        let mut lobby = Lobby::new(format!("lobby-{}", self.next_id), config);
        lobby.add_member(LobbyMember::new(host.to_string()))?;

        let lobby_id = lobby.id.clone();
        self.player_index.insert(host.to_string(), lobby_id.clone());
        self.lobbies.insert(lobby_id.clone(), lobby);
        info!(lobby = %lobby_id, host, "lobby created");
        Ok(lobby_id)
    }

    pub fn get(&self, lobby_id: &str) -> Option<&Lobby> {
        self.lobbies.get(lobby_id)
    }

    pub fn get_mut(&mut self, lobby_id: &str) -> Option<&mut Lobby> {
        self.lobbies.get_mut(lobby_id)
    }

    /// Get lobby for a player.
    pub fn get_for_player(&self, username: &str) -> Option<&Lobby> {
        self.player_index
            .get(username)
            .and_then(|id| self.lobbies.get(id))
    }

    /// Get mutable lobby for a player.
    pub fn get_for_player_mut(&mut self, username: &str) -> Option<&mut Lobby> {
        let id = self.player_index.get(username)?.clone();
        self.lobbies.get_mut(&id)
    }

    /// Add player to a lobby.
    pub fn join(&mut self, lobby_id: &str, username: &str) -> Result<(), LobbyError> {
        // A player sits in at most one lobby
        if self.player_index.contains_key(username) {
            return Err(LobbyError::AlreadyInGame(username.to_string()));
        }
        let lobby = self
            .lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| LobbyError::NotFound(lobby_id.to_string()))?;
        lobby.add_member(LobbyMember::new(username.to_string()))?;

        self.player_index
            .insert(username.to_string(), lobby_id.to_string());
        info!(lobby = %lobby_id, username, "joined lobby");
        Ok(())
    }

    /// Remove player from their lobby; an emptied lobby is closed.
    pub fn leave(&mut self, username: &str) -> Result<(String, LobbyMember), LobbyError> {
        let lobby_id = self
            .player_index
            .get(username)
            .cloned()
            .ok_or(LobbyError::NotMember)?;
        let lobby = self
            .lobbies
            .get_mut(&lobby_id)
            .ok_or_else(|| LobbyError::NotFound(lobby_id.clone()))?;
        if lobby.has_active_game() {
            return Err(LobbyError::GameInProgress);
        }
        let member = lobby.remove_member(username).ok_or(LobbyError::NotMember)?;
        let emptied = lobby.is_empty();

        self.player_index.remove(username);
        if emptied {
            self.lobbies.remove(&lobby_id);
        }
        info!(lobby = %lobby_id, username, "left lobby");
        Ok((lobby_id, member))
    }

    /// Set ready state of a player in their lobby.
    pub fn set_ready(&mut self, username: &str, ready: bool) -> Result<&Lobby, LobbyError> {
        let lobby = self
            .get_for_player_mut(username)
            .ok_or(LobbyError::NotMember)?;
        if lobby.has_active_game() {
            return Err(LobbyError::GameInProgress);
        }
        lobby.set_ready(username, ready)?;
        Ok(lobby)
    }

    /// Remove a lobby entirely.
    pub fn remove(&mut self, lobby_id: &str) -> Option<Lobby> {
        let lobby = self.lobbies.remove(lobby_id)?;
        for member in lobby.members() {
            self.player_index.remove(&member.username);
        }
        Some(lobby)
    }

    pub fn count(&self) -> usize {
        self.lobbies.len()
    }

    pub fn lobby_ids(&self) -> impl Iterator<Item = &String> {
        self.lobbies.keys()
    }
}
