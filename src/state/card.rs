//! Encounter cards.
//!
//! Card content is supplied by the caller; this module only defines the
//! closed set of card kinds the flight driver knows how to resolve.

use serde::{Deserialize, Serialize};

use super::component::{Direction, GoodColor};

/// Meteor size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeteorSize {
    /// Bounces off smooth sides, stopped by shields.
    Small,
    /// Only stopped by a cannon aimed at it.
    Large,
}

/// A single meteor of a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meteor {
    pub size: MeteorSize,
    /// Side of the ship the meteor comes from
    pub from: Direction,
}

/// What an encounter card does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardKind {
    /// Every player moves forward by engine power.
    OpenSpace,
    /// Every player moves back one cell per exposed connector.
    Stardust,
    /// Adjacent occupied cabins each lose one crew member.
    Epidemic,
    Planets {
        planets: Vec<Vec<GoodColor>>,
        days: u32,
    },
    AbandonedShip {
        crew: u32,
        credits: u32,
        days: u32,
    },
    AbandonedStation {
        crew: u32,
        goods: Vec<GoodColor>,
        days: u32,
    },
    MeteorSwarm {
        meteors: Vec<Meteor>,
    },
    Smugglers {
        firepower: f32,
        goods_penalty: u32,
        reward: Vec<GoodColor>,
        days: u32,
    },
    Slavers {
        firepower: f32,
        crew_penalty: u32,
        credits: u32,
        days: u32,
    },
}

impl CardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenSpace => "open_space",
            Self::Stardust => "stardust",
            Self::Epidemic => "epidemic",
            Self::Planets { .. } => "planets",
            Self::AbandonedShip { .. } => "abandoned_ship",
            Self::AbandonedStation { .. } => "abandoned_station",
            Self::MeteorSwarm { .. } => "meteor_swarm",
            Self::Smugglers { .. } => "smugglers",
            Self::Slavers { .. } => "slavers",
        }
    }
}

/// An encounter card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: u32,
    /// Part of the learner-flight deck
    pub learner: bool,
    pub kind: CardKind,
}

impl Card {
    pub fn new(id: u32, learner: bool, kind: CardKind) -> Self {
        Self { id, learner, kind }
    }
}

/// A face-down pile of cards players can peek at while building.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CardPile {
    pub cards: Vec<Card>,
    /// Player currently looking at the pile
    pub looked_by: Option<String>,
}

impl CardPile {
    pub fn new(cards: Vec<Card>) -> Self {
        Self {
            cards,
            looked_by: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.looked_by.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_json_tagging() {
        let card = Card::new(
            7,
            true,
            CardKind::AbandonedShip {
                crew: 2,
                credits: 5,
                days: 1,
            },
        );
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["kind"]["type"], "abandoned_ship");
        assert_eq!(json["kind"]["credits"], 5);

        let back: Card = serde_json::from_value(json).unwrap();
        assert_eq!(back, card);
    }

    #[test]
    fn test_pile_lock() {
        let mut pile = CardPile::new(vec![Card::new(1, false, CardKind::Stardust)]);
        assert!(pile.is_free());
        pile.looked_by = Some("alice".to_string());
        assert!(!pile.is_free());
    }
}
