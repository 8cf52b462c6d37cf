//! State-change events and the per-command event collector.
//!
//! Every mutation emits an [`Event`] into an [`EventCollector`] owned by the
//! caller. Regular events are kept in emission order; unique events collapse
//! by key so that only the latest value of an aggregate is delivered.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::card::{Card, MeteorSize};
use super::component::{AlienType, Component, ComponentId, Direction, GoodsCount};
use super::player::PlayerState;

/// Who receives an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "targets", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    AllPlayers,
    /// Everyone except the acting player
    OtherPlayers,
    PlayerOnly,
    SpecificPlayers(Vec<String>),
}

/// Result of a player's turn against an encounter card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Moved { steps: i64 },
    Won,
    Tied,
    Lost,
    Landed { planet: usize },
    Accepted,
    Declined,
    Deflected,
    Hit { component: ComponentId },
    Missed,
}

/// Why a player left the flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    Voluntary,
    NoEnginePower,
    NoCrew,
    Lapped,
}

/// Closed set of event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ComponentPicked,
    ComponentReleased,
    ComponentReserved,
    ComponentRotated,
    ComponentInserted,
    ComponentMoved,
    ComponentDestroyed,
    ComponentUpdated,
    ComponentsDiscarded,
    ShipBroken,
    ShipPartKept,
    ShipCheckFailed,
    AlienAssigned,
    CrewUpdated,
    BatteriesUpdated,
    GoodsUpdated,
    CreditsUpdated,
    PositionUpdated,
    PlayersStateUpdated,
    CardPileLooked,
    CardPileContents,
    CardPileReleased,
    HourglassMoved,
    HourglassExpired,
    BuildingFinished,
    FlightStarted,
    CardDrawn,
    DiceRolled,
    MeteorIncoming,
    EncounterOutcome,
    CardResolved,
    PlayerRetired,
    GameEnded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComponentPicked => "COMPONENT_PICKED",
            Self::ComponentReleased => "COMPONENT_RELEASED",
            Self::ComponentReserved => "COMPONENT_RESERVED",
            Self::ComponentRotated => "COMPONENT_ROTATED",
            Self::ComponentInserted => "COMPONENT_INSERTED",
            Self::ComponentMoved => "COMPONENT_MOVED",
            Self::ComponentDestroyed => "COMPONENT_DESTROYED",
            Self::ComponentUpdated => "COMPONENT_UPDATED",
            Self::ComponentsDiscarded => "COMPONENTS_DISCARDED",
            Self::ShipBroken => "SHIP_BROKEN",
            Self::ShipPartKept => "SHIP_PART_KEPT",
            Self::ShipCheckFailed => "SHIP_CHECK_FAILED",
            Self::AlienAssigned => "ALIEN_ASSIGNED",
            Self::CrewUpdated => "CREW_UPDATED",
            Self::BatteriesUpdated => "BATTERIES_UPDATED",
            Self::GoodsUpdated => "GOODS_UPDATED",
            Self::CreditsUpdated => "CREDITS_UPDATED",
            Self::PositionUpdated => "POSITION_UPDATED",
            Self::PlayersStateUpdated => "PLAYERS_STATE_UPDATED",
            Self::CardPileLooked => "CARD_PILE_LOOKED",
            Self::CardPileContents => "CARD_PILE_CONTENTS",
            Self::CardPileReleased => "CARD_PILE_RELEASED",
            Self::HourglassMoved => "HOURGLASS_MOVED",
            Self::HourglassExpired => "HOURGLASS_EXPIRED",
            Self::BuildingFinished => "BUILDING_FINISHED",
            Self::FlightStarted => "FLIGHT_STARTED",
            Self::CardDrawn => "CARD_DRAWN",
            Self::DiceRolled => "DICE_ROLLED",
            Self::MeteorIncoming => "METEOR_INCOMING",
            Self::EncounterOutcome => "ENCOUNTER_OUTCOME",
            Self::CardResolved => "CARD_RESOLVED",
            Self::PlayerRetired => "PLAYER_RETIRED",
            Self::GameEnded => "GAME_ENDED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event arguments, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    ComponentPicked {
        player: String,
        component: Component,
    },
    ComponentReleased {
        player: String,
        component: ComponentId,
    },
    ComponentReserved {
        player: String,
        component: ComponentId,
    },
    ComponentRotated {
        player: String,
        component: ComponentId,
        rotation: u8,
    },
    ComponentInserted {
        player: String,
        component: Component,
        row: usize,
        col: usize,
    },
    ComponentMoved {
        player: String,
        component: ComponentId,
        row: usize,
        col: usize,
        rotation: u8,
    },
    ComponentDestroyed {
        player: String,
        component: ComponentId,
    },
    /// Latest contents of a component (charge, crew, goods).
    ComponentUpdated {
        player: String,
        component: Component,
    },
    ComponentsDiscarded {
        player: String,
        components: Vec<ComponentId>,
    },
    ShipBroken {
        player: String,
        parts: Vec<Vec<ComponentId>>,
    },
    ShipPartKept {
        player: String,
        part: usize,
        discarded: Vec<ComponentId>,
    },
    ShipCheckFailed {
        player: String,
        components: Vec<ComponentId>,
    },
    AlienAssigned {
        player: String,
        cabin: ComponentId,
        alien: AlienType,
    },
    CrewUpdated {
        player: String,
        crew: u32,
    },
    BatteriesUpdated {
        player: String,
        batteries: u32,
    },
    GoodsUpdated {
        player: String,
        goods: GoodsCount,
    },
    CreditsUpdated {
        player: String,
        credits: u32,
    },
    PositionUpdated {
        player: String,
        position: i64,
    },
    PlayersStateUpdated {
        states: Vec<(String, PlayerState)>,
    },
    CardPileLooked {
        player: String,
        pile: usize,
    },
    CardPileContents {
        pile: usize,
        cards: Vec<Card>,
    },
    CardPileReleased {
        player: String,
        pile: usize,
    },
    /// Hourglass flipped, or started when `player` is `None`.
    HourglassMoved {
        player: Option<String>,
        position: u8,
        expires_at: chrono::DateTime<chrono::Utc>,
    },
    HourglassExpired {
        position: u8,
    },
    BuildingFinished {
        player: String,
        order: usize,
    },
    FlightStarted {
        order: Vec<String>,
    },
    CardDrawn {
        player: String,
        card: Card,
        remaining: usize,
    },
    DiceRolled {
        player: String,
        dice: [u8; 2],
    },
    MeteorIncoming {
        size: MeteorSize,
        from: Direction,
        line: Option<usize>,
    },
    EncounterOutcome {
        player: String,
        outcome: Outcome,
    },
    CardResolved {
        card: u32,
    },
    PlayerRetired {
        player: String,
        reason: RetireReason,
    },
    GameEnded {
        scores: Vec<(String, i64)>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ComponentPicked { .. } => EventKind::ComponentPicked,
            Self::ComponentReleased { .. } => EventKind::ComponentReleased,
            Self::ComponentReserved { .. } => EventKind::ComponentReserved,
            Self::ComponentRotated { .. } => EventKind::ComponentRotated,
            Self::ComponentInserted { .. } => EventKind::ComponentInserted,
            Self::ComponentMoved { .. } => EventKind::ComponentMoved,
            Self::ComponentDestroyed { .. } => EventKind::ComponentDestroyed,
            Self::ComponentUpdated { .. } => EventKind::ComponentUpdated,
            Self::ComponentsDiscarded { .. } => EventKind::ComponentsDiscarded,
            Self::ShipBroken { .. } => EventKind::ShipBroken,
            Self::ShipPartKept { .. } => EventKind::ShipPartKept,
            Self::ShipCheckFailed { .. } => EventKind::ShipCheckFailed,
            Self::AlienAssigned { .. } => EventKind::AlienAssigned,
            Self::CrewUpdated { .. } => EventKind::CrewUpdated,
            Self::BatteriesUpdated { .. } => EventKind::BatteriesUpdated,
            Self::GoodsUpdated { .. } => EventKind::GoodsUpdated,
            Self::CreditsUpdated { .. } => EventKind::CreditsUpdated,
            Self::PositionUpdated { .. } => EventKind::PositionUpdated,
            Self::PlayersStateUpdated { .. } => EventKind::PlayersStateUpdated,
            Self::CardPileLooked { .. } => EventKind::CardPileLooked,
            Self::CardPileContents { .. } => EventKind::CardPileContents,
            Self::CardPileReleased { .. } => EventKind::CardPileReleased,
            Self::HourglassMoved { .. } => EventKind::HourglassMoved,
            Self::HourglassExpired { .. } => EventKind::HourglassExpired,
            Self::BuildingFinished { .. } => EventKind::BuildingFinished,
            Self::FlightStarted { .. } => EventKind::FlightStarted,
            Self::CardDrawn { .. } => EventKind::CardDrawn,
            Self::DiceRolled { .. } => EventKind::DiceRolled,
            Self::MeteorIncoming { .. } => EventKind::MeteorIncoming,
            Self::EncounterOutcome { .. } => EventKind::EncounterOutcome,
            Self::CardResolved { .. } => EventKind::CardResolved,
            Self::PlayerRetired { .. } => EventKind::PlayerRetired,
            Self::GameEnded { .. } => EventKind::GameEnded,
        }
    }

    /// Deduplication key for aggregate-style events.
    pub fn unique_key(&self) -> Option<String> {
        let kind = self.kind();
        match self {
            Self::ComponentUpdated { component, .. } => Some(format!("{}:{}", kind, component.id.0)),
            Self::CrewUpdated { player, .. }
            | Self::BatteriesUpdated { player, .. }
            | Self::GoodsUpdated { player, .. }
            | Self::CreditsUpdated { player, .. }
            | Self::PositionUpdated { player, .. } => Some(format!("{}:{}", kind, player)),
            Self::PlayersStateUpdated { .. } => Some(kind.as_str().to_string()),
            _ => None,
        }
    }
}

/// An immutable state-change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Player whose action produced the event; `None` for timer-driven events
    pub actor: Option<String>,
    pub visibility: Visibility,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(actor: Option<&str>, visibility: Visibility, payload: EventPayload) -> Self {
        Self {
            actor: actor.map(str::to_string),
            visibility,
            payload,
        }
    }

    pub fn all(actor: &str, payload: EventPayload) -> Self {
        Self::new(Some(actor), Visibility::AllPlayers, payload)
    }

    pub fn others(actor: &str, payload: EventPayload) -> Self {
        Self::new(Some(actor), Visibility::OtherPlayers, payload)
    }

    pub fn player_only(actor: &str, payload: EventPayload) -> Self {
        Self::new(Some(actor), Visibility::PlayerOnly, payload)
    }

    pub fn system(payload: EventPayload) -> Self {
        Self::new(None, Visibility::AllPlayers, payload)
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn unique_key(&self) -> Option<String> {
        self.payload.unique_key()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Pending events of one logical unit of work.
#[derive(Debug, Default)]
pub struct EventCollector {
    regular: Vec<Event>,
    unique: BTreeMap<String, Event>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event, replacing a pending unique event with the same key.
    pub fn emit(&mut self, event: Event) {
        match event.unique_key() {
            Some(key) => {
                self.unique.insert(key, event);
            }
            None => self.regular.push(event),
        }
    }

    /// Run `f` in a nested batch; its events join this collector only if it succeeds.
    pub fn scope<T, E>(
        &mut self,
        f: impl FnOnce(&mut EventCollector) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut inner = EventCollector::new();
        let result = f(&mut inner);
        if result.is_ok() {
            self.absorb(inner);
        }
        result
    }

    /// Merge another collector's pending events after ours.
    pub fn absorb(&mut self, other: EventCollector) {
        self.regular.extend(other.regular);
        self.unique.extend(other.unique);
    }

    pub fn len(&self) -> usize {
        self.regular.len() + self.unique.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.unique.is_empty()
    }

    /// Drain regular events in emission order followed by unique events in key order.
    pub fn flush(&mut self) -> Vec<Event> {
        let mut events = std::mem::take(&mut self.regular);
        events.extend(std::mem::take(&mut self.unique).into_values());
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn crew(player: &str, crew: u32) -> Event {
        Event::all(
            player,
            EventPayload::CrewUpdated {
                player: player.to_string(),
                crew,
            },
        )
    }

    fn destroyed(player: &str, id: u32) -> Event {
        Event::all(
            player,
            EventPayload::ComponentDestroyed {
                player: player.to_string(),
                component: ComponentId(id),
            },
        )
    }

    #[test]
    fn test_unique_event_keeps_latest() {
        let mut events = EventCollector::new();
        events.emit(crew("alice", 2));
        events.emit(crew("alice", 4));

        let flushed = events.flush();
        assert_eq!(flushed, vec![crew("alice", 4)]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_unique_keys_are_per_entity() {
        let mut events = EventCollector::new();
        events.emit(crew("alice", 2));
        events.emit(crew("bob", 2));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_regular_events_never_merge() {
        let mut events = EventCollector::new();
        events.emit(destroyed("alice", 1));
        events.emit(crew("alice", 0));
        events.emit(destroyed("alice", 1));

        let flushed = events.flush();
        assert_eq!(flushed.len(), 3);
        assert_eq!(flushed[0].kind(), EventKind::ComponentDestroyed);
        assert_eq!(flushed[1].kind(), EventKind::ComponentDestroyed);
        assert_eq!(flushed[2].kind(), EventKind::CrewUpdated);
    }

    #[test]
    fn test_scope_discards_on_error() {
        let mut events = EventCollector::new();
        events.emit(destroyed("alice", 1));

        let failed: Result<(), &str> = events.scope(|inner| {
            inner.emit(destroyed("alice", 2));
            Err("nope")
        });
        assert!(failed.is_err());
        assert_eq!(events.len(), 1);

        let ok: Result<(), &str> = events.scope(|inner| {
            inner.emit(crew("alice", 1));
            inner.emit(crew("alice", 3));
            Ok(())
        });
        assert!(ok.is_ok());
        let flushed = events.flush();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[1], crew("alice", 3));
    }

    #[test]
    fn test_scope_replaces_outer_unique() {
        let mut events = EventCollector::new();
        events.emit(crew("alice", 1));
        let _: Result<(), ()> = events.scope(|inner| {
            inner.emit(crew("alice", 5));
            Ok(())
        });
        assert_eq!(events.flush(), vec![crew("alice", 5)]);
    }

    #[test]
    fn test_event_json_shape() {
        let json = crew("alice", 2).to_json();
        assert_eq!(json["payload"]["type"], "CREW_UPDATED");
        assert_eq!(json["visibility"]["scope"], "ALL_PLAYERS");
        assert_eq!(json["actor"], "alice");
    }
}
