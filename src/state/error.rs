//! Engine error taxonomy.
//!
//! Every variant is locally recoverable: a failing command returns one of
//! these without having touched shared state.

use super::component::ComponentId;
use super::player::PlayerState;

/// Resource a command tried to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Batteries,
    Crew,
    Goods,
    Cargo,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batteries => write!(f, "batteries"),
            Self::Crew => write!(f, "crew"),
            Self::Goods => write!(f, "goods"),
            Self::Cargo => write!(f, "cargo space"),
        }
    }
}

/// Entity a command referred to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Component(ComponentId),
    Player(String),
    CardPile(usize),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Component(id) => write!(f, "component {}", id),
            Self::Player(name) => write!(f, "player {}", name),
            Self::CardPile(index) => write!(f, "card pile {}", index),
        }
    }
}

/// Errors returned by ship construction and command handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("position ({row}, {col}) is not a free playable cell")]
    PositionInvalid { row: usize, col: usize },
    #[error("connectors of component {0} do not match its neighbors")]
    ConnectorMismatch(ComponentId),
    #[error("component {0} would not touch any other component")]
    IsolatedPlacement(ComponentId),
    #[error("component {0} has not been revealed")]
    ComponentNotVisible(ComponentId),
    #[error("component {0} is already welded")]
    AlreadyWelded(ComponentId),
    #[error("action not allowed while in phase {0}")]
    IllegalPhase(PlayerState),
    #[error("not enough {0}")]
    InsufficientResource(Resource),
    #[error("unknown {0}")]
    EntityNotFound(Entity),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl EngineError {
    pub(crate) fn component(id: ComponentId) -> Self {
        Self::EntityNotFound(Entity::Component(id))
    }

    pub(crate) fn player(name: &str) -> Self {
        Self::EntityNotFound(Entity::Player(name.to_string()))
    }
}
