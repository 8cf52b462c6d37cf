//! Player phase state machine.
//!
//! Each player carries one [`PlayerState`] that gates which commands are
//! legal. Handlers call [`PlayerPhases::require`] before touching anything.
//!
//! # Phase Flow
//!
//! ```text
//!  BUILD ◀──────▶ LOOK_CARD_PILE
//!    │ finish building / hourglass runs out
//!    ▼
//!  CHECK ──▶ WAIT_SHIP_PART ──▶ CHECK
//!    │ ship valid
//!    ▼
//!  WAIT_ALIEN (forward scan, one player at a time)
//!    │
//!    ▼
//!  DRAW_CARD (leader) / WAIT ──▶ WAIT_* (card specific) ──▶ WAIT
//!    │                                      │
//!    │ end flight / retired                 │ deck exhausted
//!    ▼                                      ▼
//!  DONE ───────────────────────────────────▶ END
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::event::{Event, EventCollector, EventPayload};

/// Phase of a single player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Build,
    LookCardPile,
    Check,
    WaitAlien,
    WaitShipPart,
    DrawCard,
    Wait,
    WaitCannons,
    WaitEngines,
    WaitGoods,
    WaitRemoveGoods,
    WaitRollDices,
    WaitRemoveCrew,
    WaitShield,
    WaitBoolean,
    WaitIndex,
    Done,
    End,
}

impl PlayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "BUILD",
            Self::LookCardPile => "LOOK_CARD_PILE",
            Self::Check => "CHECK",
            Self::WaitAlien => "WAIT_ALIEN",
            Self::WaitShipPart => "WAIT_SHIP_PART",
            Self::DrawCard => "DRAW_CARD",
            Self::Wait => "WAIT",
            Self::WaitCannons => "WAIT_CANNONS",
            Self::WaitEngines => "WAIT_ENGINES",
            Self::WaitGoods => "WAIT_GOODS",
            Self::WaitRemoveGoods => "WAIT_REMOVE_GOODS",
            Self::WaitRollDices => "WAIT_ROLL_DICES",
            Self::WaitRemoveCrew => "WAIT_REMOVE_CREW",
            Self::WaitShield => "WAIT_SHIELD",
            Self::WaitBoolean => "WAIT_BOOLEAN",
            Self::WaitIndex => "WAIT_INDEX",
            Self::Done => "DONE",
            Self::End => "END",
        }
    }

    /// Still assembling the ship.
    pub fn is_building(&self) -> bool {
        matches!(self, Self::Build | Self::LookCardPile)
    }

    /// Expected to answer an encounter prompt.
    pub fn is_prompted(&self) -> bool {
        matches!(
            self,
            Self::WaitCannons
                | Self::WaitEngines
                | Self::WaitGoods
                | Self::WaitRemoveGoods
                | Self::WaitRollDices
                | Self::WaitRemoveCrew
                | Self::WaitShield
                | Self::WaitBoolean
                | Self::WaitIndex
                | Self::WaitShipPart
        )
    }

    /// Out of the flight for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::End)
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of every player in a match, kept in turn order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerPhases {
    order: Vec<String>,
    states: HashMap<String, PlayerState>,
}

impl PlayerPhases {
    /// Everyone starts building.
    pub fn new(players: &[String]) -> Self {
        Self {
            order: players.to_vec(),
            states: players
                .iter()
                .map(|p| (p.clone(), PlayerState::Build))
                .collect(),
        }
    }

    /// Restore from `(player, state)` pairs in turn order.
    pub fn restore(states: Vec<(String, PlayerState)>) -> Self {
        Self {
            order: states.iter().map(|(p, _)| p.clone()).collect(),
            states: states.into_iter().collect(),
        }
    }

    pub fn get(&self, player: &str) -> Result<PlayerState, EngineError> {
        self.states
            .get(player)
            .copied()
            .ok_or_else(|| EngineError::player(player))
    }

    /// Fail with `IllegalPhase` unless the player is in one of `allowed`.
    pub fn require(
        &self,
        player: &str,
        allowed: &[PlayerState],
    ) -> Result<PlayerState, EngineError> {
        let state = self.get(player)?;
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(EngineError::IllegalPhase(state))
        }
    }

    pub fn is(&self, player: &str, state: PlayerState) -> bool {
        self.states.get(player) == Some(&state)
    }

    /// Move a player to a new phase and publish the full map.
    pub fn set(&mut self, player: &str, state: PlayerState, events: &mut EventCollector) {
        if let Some(slot) = self.states.get_mut(player) {
            *slot = state;
        }
        events.emit(Event::system(EventPayload::PlayersStateUpdated {
            states: self.snapshot(),
        }));
    }

    pub fn set_all(&mut self, state: PlayerState, events: &mut EventCollector) {
        for slot in self.states.values_mut() {
            *slot = state;
        }
        events.emit(Event::system(EventPayload::PlayersStateUpdated {
            states: self.snapshot(),
        }));
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Players currently in `state`, in turn order.
    pub fn in_state(&self, state: PlayerState) -> Vec<String> {
        self.order
            .iter()
            .filter(|p| self.is(p, state))
            .cloned()
            .collect()
    }

    pub fn any(&self, predicate: impl Fn(PlayerState) -> bool) -> bool {
        self.states.values().any(|s| predicate(*s))
    }

    /// `(player, state)` pairs in turn order.
    pub fn snapshot(&self) -> Vec<(String, PlayerState)> {
        self.order
            .iter()
            .filter_map(|p| self.states.get(p).map(|s| (p.clone(), *s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::event::EventKind;
    use pretty_assertions::assert_eq;

    fn phases() -> PlayerPhases {
        PlayerPhases::new(&["alice".to_string(), "bob".to_string()])
    }

    #[test]
    fn test_initial_state() {
        let p = phases();
        assert_eq!(p.get("alice").unwrap(), PlayerState::Build);
        assert_eq!(p.get("bob").unwrap(), PlayerState::Build);
        assert!(p.get("carol").is_err());
    }

    #[test]
    fn test_require() {
        let p = phases();
        assert!(p.require("alice", &[PlayerState::Build]).is_ok());
        assert_eq!(
            p.require("alice", &[PlayerState::DrawCard]),
            Err(EngineError::IllegalPhase(PlayerState::Build))
        );
    }

    #[test]
    fn test_set_publishes_one_state_map() {
        let mut p = phases();
        let mut events = EventCollector::new();
        p.set("alice", PlayerState::Wait, &mut events);
        p.set("bob", PlayerState::Check, &mut events);

        let flushed = events.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind(), EventKind::PlayersStateUpdated);
        assert_eq!(
            flushed[0].payload,
            EventPayload::PlayersStateUpdated {
                states: vec![
                    ("alice".to_string(), PlayerState::Wait),
                    ("bob".to_string(), PlayerState::Check),
                ]
            }
        );
    }

    #[test]
    fn test_in_state_keeps_turn_order() {
        let mut p = phases();
        let mut events = EventCollector::new();
        p.set_all(PlayerState::Wait, &mut events);
        assert_eq!(p.in_state(PlayerState::Wait), vec!["alice", "bob"]);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", PlayerState::WaitRollDices), "WAIT_ROLL_DICES");
        assert!(PlayerState::LookCardPile.is_building());
        assert!(PlayerState::WaitShield.is_prompted());
        assert!(PlayerState::End.is_terminal());
    }
}
