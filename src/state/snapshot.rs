//! Flat, serializable copy of a match.
//!
//! A snapshot carries everything needed to rebuild the match, except the
//! random generator which is reseeded on restore. [`GameSnapshot::for_player`]
//! derives the view sent to a reconnecting client.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::card::{Card, CardPile};
use super::component::{Component, ComponentId, GoodsCount};
use super::encounter::Encounter;
use super::error::EngineError;
use super::flight::{FlightBoard, Hourglass, MAX_HOURGLASS_SECS};
use super::game::{Game, GameConfig, GamePhase};
use super::player::{PlayerPhases, PlayerState};
use super::ship::Ship;

/// One player's ship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipSnapshot {
    pub owner: String,
    /// Dashboard rows of component ids
    pub dashboard: Vec<Vec<Option<ComponentId>>>,
    /// Every component the player holds, by id
    pub components: Vec<Component>,
    pub hand: Option<ComponentId>,
    pub reserve: Vec<ComponentId>,
    pub discard: Vec<ComponentId>,
    pub crew: u32,
    pub batteries: u32,
    pub goods: GoodsCount,
}

impl ShipSnapshot {
    fn of(ship: &Ship) -> Self {
        let mut components: Vec<Component> = ship.components().cloned().collect();
        components.sort_by_key(|c| c.id);
        Self {
            owner: ship.owner().to_string(),
            dashboard: ship.dashboard_ids(),
            components,
            hand: ship.hand(),
            reserve: ship.reserve().to_vec(),
            discard: ship.discard().to_vec(),
            crew: ship.crew(),
            batteries: ship.batteries(),
            goods: ship.goods(),
        }
    }
}

/// State of a whole match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub id: String,
    pub lobby_id: String,
    pub config: GameConfig,
    pub phase: GamePhase,
    /// Player phases in turn order
    pub states: Vec<(String, PlayerState)>,
    /// Ships in turn order
    pub ships: Vec<ShipSnapshot>,
    pub pool: Vec<Component>,
    /// Ids of face-down pool components, filled only in a player view
    #[serde(default)]
    pub hidden_pool: Vec<ComponentId>,
    pub piles: Vec<CardPile>,
    pub deck: Vec<Card>,
    pub deck_len: usize,
    pub hourglass: Option<Hourglass>,
    pub flight: FlightBoard,
    pub credits: BTreeMap<String, u32>,
    pub finished: Vec<String>,
    pub alien_cursor: usize,
    pub alien_done: Vec<String>,
    pub pending_parts: BTreeMap<String, Vec<Vec<ComponentId>>>,
    pub encounter: Option<Encounter>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl GameSnapshot {
    /// View for one client: face-down pool components are reduced to their
    /// ids, the deck and card piles the player is not looking at are left out.
    ///
    /// The result can no longer be restored.
    pub fn for_player(&self, player: &str) -> Self {
        let mut view = self.clone();
        let (shown, hidden): (Vec<Component>, Vec<Component>) =
            std::mem::take(&mut view.pool).into_iter().partition(|c| c.shown);
        view.pool = shown;
        view.hidden_pool.extend(hidden.into_iter().map(|c| c.id));
        view.deck.clear();
        for pile in &mut view.piles {
            if pile.looked_by.as_deref() != Some(player) {
                pile.cards.clear();
            }
        }
        view
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Game {
    pub fn snapshot(&self) -> GameSnapshot {
        let mut alien_done: Vec<String> = self.alien_done.iter().cloned().collect();
        alien_done.sort();

        GameSnapshot {
            id: self.id.clone(),
            lobby_id: self.lobby_id.clone(),
            config: self.config.clone(),
            phase: self.phase,
            states: self.phases.snapshot(),
            ships: self
                .players
                .iter()
                .filter_map(|p| self.ships.get(p))
                .map(ShipSnapshot::of)
                .collect(),
            pool: self.pool.values().cloned().collect(),
            hidden_pool: Vec::new(),
            piles: self.piles.clone(),
            deck: self.deck.clone(),
            deck_len: self.deck.len(),
            hourglass: self.hourglass.clone(),
            flight: self.flight.clone(),
            credits: self
                .credits
                .iter()
                .map(|(p, c)| (p.clone(), *c))
                .collect(),
            finished: self.finished.clone(),
            alien_cursor: self.alien_cursor,
            alien_done,
            pending_parts: self
                .pending_parts
                .iter()
                .map(|(p, parts)| (p.clone(), parts.clone()))
                .collect(),
            encounter: self.encounter.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    /// Rebuild a match; ship counters are recomputed from the components.
    pub fn from_snapshot(snapshot: GameSnapshot) -> Result<Self, EngineError> {
        let players: Vec<String> = snapshot.states.iter().map(|(p, _)| p.clone()).collect();
        let owners: HashSet<&String> = snapshot.ships.iter().map(|s| &s.owner).collect();
        if owners.len() != players.len() || players.iter().any(|p| !owners.contains(p)) {
            return Err(EngineError::InvalidArgument("ships do not match players"));
        }
        if !snapshot.hidden_pool.is_empty() {
            return Err(EngineError::InvalidArgument("a player view cannot be restored"));
        }
        snapshot.config.validate()?;
        if let Some(glass) = &snapshot.hourglass {
            if !(1..=MAX_HOURGLASS_SECS).contains(&glass.duration_secs) {
                return Err(EngineError::InvalidArgument("hourglass duration out of range"));
            }
        }

        let mode = snapshot.config.mode;
        let ships = snapshot
            .ships
            .into_iter()
            .map(|s| {
                let ship = Ship::restore(
                    s.owner.clone(),
                    mode,
                    s.components,
                    s.hand,
                    s.reserve,
                    s.discard,
                );
                (s.owner, ship)
            })
            .collect();
        let rng = snapshot
            .config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);

        Ok(Self {
            id: snapshot.id,
            lobby_id: snapshot.lobby_id,
            config: snapshot.config,
            phase: snapshot.phase,
            players,
            phases: PlayerPhases::restore(snapshot.states),
            ships,
            pool: snapshot.pool.into_iter().map(|c| (c.id, c)).collect(),
            piles: snapshot.piles,
            deck: snapshot.deck,
            hourglass: snapshot.hourglass,
            flight: snapshot.flight,
            credits: snapshot.credits.into_iter().collect(),
            finished: snapshot.finished,
            alien_cursor: snapshot.alien_cursor,
            alien_done: snapshot.alien_done.into_iter().collect(),
            pending_parts: snapshot.pending_parts.into_iter().collect(),
            encounter: snapshot.encounter,
            rng,
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            ended_at: snapshot.ended_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::card::CardKind;
    use crate::state::component::GoodColor;
    use crate::state::game::fixtures::*;
    use crate::state::game::Command;
    use crate::state::ship::GameMode;
    use pretty_assertions::assert_eq;

    fn cards() -> Vec<Card> {
        let mut cards: Vec<Card> = (1..=10)
            .map(|id| Card::new(id, false, CardKind::OpenSpace))
            .collect();
        cards.push(Card::new(
            11,
            true,
            CardKind::Smugglers {
                firepower: 1.5,
                goods_penalty: 1,
                reward: vec![GoodColor::Blue],
                days: 1,
            },
        ));
        cards
    }

    #[test]
    fn test_json_round_trip_while_building() {
        let mut game = game(GameMode::Full, cards());
        build(&mut game, "alice", &[(5, 2, 4), (6, 2, 2)]);
        run(
            &mut game,
            "bob",
            Command::PickComponent {
                component: ComponentId(3),
            },
        );
        run(&mut game, "bob", Command::ReserveComponent);
        run(&mut game, "alice", Command::LookCardPile { pile: 2 });

        let snapshot = game.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: GameSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);

        let restored = Game::from_snapshot(parsed).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.ship("alice").unwrap().crew(), 4);
        assert_eq!(restored.ship("bob").unwrap().reserve(), &[ComponentId(3)]);
    }

    #[test]
    fn test_round_trip_during_flight() {
        let mut game = game(GameMode::Learner, cards());
        build(&mut game, "alice", &[(7, 2, 4)]);
        launch(&mut game);
        run(&mut game, "alice", Command::DrawCard);
        assert!(game.encounter().is_some());

        let snapshot = game.snapshot();
        let restored = Game::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.state("alice").unwrap(), game.state("alice").unwrap());
    }

    #[test]
    fn test_restored_match_keeps_playing() {
        let mut game = game(GameMode::Learner, cards());
        let mut restored = Game::from_snapshot(game.snapshot()).unwrap();
        build(&mut restored, "bob", &[(1, 3, 3)]);
        build(&mut game, "bob", &[(1, 3, 3)]);
        assert_eq!(
            restored.ship("bob").unwrap().dashboard_ids(),
            game.ship("bob").unwrap().dashboard_ids()
        );
    }

    #[test]
    fn test_player_view_hides_secrets() {
        let mut game = game(GameMode::Full, cards());
        run(&mut game, "bob", Command::LookCardPile { pile: 0 });

        let snapshot = game.snapshot();
        let view = snapshot.for_player("alice");
        assert!(view.deck.is_empty());
        assert_eq!(view.deck_len, snapshot.deck_len);
        assert!(view.piles.iter().all(|p| p.cards.is_empty()));
        assert!(view.pool.iter().all(|c| c.shown));
        assert_eq!(view.pool.len() + view.hidden_pool.len(), snapshot.pool.len());
        assert!(view.hidden_pool.contains(&ComponentId(1)));
        assert!(Game::from_snapshot(view).is_err());

        let bob = snapshot.for_player("bob");
        assert_eq!(bob.piles[0].cards, snapshot.piles[0].cards);
        assert_eq!(bob.to_json()["states"][1][1], "LOOK_CARD_PILE");
    }

    #[test]
    fn test_mismatched_ships_rejected() {
        let game = game(GameMode::Learner, cards());
        let mut snapshot = game.snapshot();
        snapshot.ships.pop();
        assert!(Game::from_snapshot(snapshot).is_err());
    }
}
