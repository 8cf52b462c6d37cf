//! State management module for the flight game engine.
//!
//! - `component` - Components and connector rules
//! - `ship` - Ship dashboard, construction validator and resource ledgers
//! - `player` - Player phase machine (what may each player do now?)
//! - `event` - State-change events and the per-command collector
//! - `card` / `flight` / `encounter` - Encounter deck, flight board, card resolution
//! - `game` - One match: command dispatch and phase progression
//! - `snapshot` - Flat, serializable copy of a match
//! - `router` - Event delivery by visibility
//! - `connection` / `lobby` - Session registry and lobby directory
//! - `server` - Controller tying the registries to running matches
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Server                                │
//! │                                                                    │
//! │  ┌────────────────┐  ┌────────────────┐  ┌──────────────────────┐  │
//! │  │ SessionManager │  │  LobbyManager  │  │       Matches        │  │
//! │  │  (Mutex)       │  │  (Mutex)       │  │  (Mutex)             │  │
//! │  │ username →     │  │ lobby_id →     │  │ game_id →            │  │
//! │  │   Session      │  │   Lobby        │  │   Arc<Match>         │  │
//! │  │                │  │ username →     │  │ username → game_id   │  │
//! │  │                │  │   lobby_id     │  │                      │  │
//! │  └────────────────┘  └────────────────┘  └──────────┬───────────┘  │
//! │                                                     │              │
//! │     Command ──▶ Match (Mutex<Game>) ──▶ EventCollector ──▶ router  │
//! │                                                         │          │
//! │                                                   Transport::send  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use trucker_state::state::{Command, EventCollector, Game, GameConfig, GameMode};
//!
//! let mut game = Game::new(id, lobby_id, players, components, cards, GameConfig::new(GameMode::Full))?;
//! let mut events = EventCollector::new();
//! game.start(now, &mut events)?;
//! game.apply("alice", Command::DrawCard, now, &mut events)?;
//! let flushed = events.flush();
//! ```

pub mod card;
pub mod component;
pub mod connection;
pub mod encounter;
pub mod error;
pub mod event;
pub mod flight;
pub mod game;
pub mod lobby;
pub mod player;
pub mod router;
pub mod server;
pub mod ship;
pub mod snapshot;

// Re-export commonly used types
pub use card::{Card, CardKind, CardPile, Meteor, MeteorSize};
pub use component::{
    AlienType, Component, ComponentId, ComponentKind, ConnectorType, Direction, GoodColor,
    GoodsCount,
};
pub use connection::{Attach, Session, SessionConfig, SessionError, SessionManager};
pub use encounter::Encounter;
pub use error::{EngineError, Entity, Resource};
pub use event::{Event, EventCollector, EventKind, EventPayload, Outcome, RetireReason, Visibility};
pub use flight::{FlightBoard, Hourglass};
pub use game::{AlienPlacement, Command, Game, GameConfig, GamePhase, MAX_PLAYERS, MIN_PLAYERS};
pub use lobby::{Lobby, LobbyError, LobbyManager, LobbyMember, MAX_LOBBY_PLAYERS};
pub use player::{PlayerPhases, PlayerState};
pub use router::{route, DeliveryReport, Outbound, Transport, TransportError};
pub use server::{ContentSource, Match, Server, ServerError};
pub use ship::{GameMode, Position, Ship, COLS, ROWS};
pub use snapshot::{GameSnapshot, ShipSnapshot};
