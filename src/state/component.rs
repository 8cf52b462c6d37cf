//! Ship components and the connector algebra.
//!
//! A component has four typed connectors indexed `[Up, Right, Down, Left]`.
//! Rotating clockwise shifts the array last-to-first, so the side that faced
//! left ends up facing up.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ship::Position;

/// Humans a cabin holds once it is welded into a ship.
pub const CABIN_CAPACITY: u32 = 2;

/// Crew units an alien occupant counts for.
pub const ALIEN_CREW: u32 = 2;

/// Stable component identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub u32);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connector on one side of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorType {
    Empty,
    Single,
    Double,
    Universal,
}

impl ConnectorType {
    /// Whether two facing connectors may touch.
    ///
    /// An empty side never matches, not even against a universal one.
    pub fn compatible(self, other: Self) -> bool {
        match (self, other) {
            (Self::Empty, _) | (_, Self::Empty) => false,
            (Self::Universal, _) | (_, Self::Universal) => true,
            (a, b) => a == b,
        }
    }

    pub fn is_empty(self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Side of a component, or the direction something faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Right,
    Down,
    Left,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Self::Up, Self::Right, Self::Down, Self::Left];

    pub fn index(self) -> usize {
        match self {
            Self::Up => 0,
            Self::Right => 1,
            Self::Down => 2,
            Self::Left => 3,
        }
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % 4]
    }

    pub fn opposite(self) -> Self {
        self.rotated(2)
    }

    /// Direction after `times` clockwise quarter turns.
    pub fn rotated(self, times: u8) -> Self {
        Self::from_index(self.index() + times as usize)
    }

    /// Row and column delta of one step in this direction.
    pub fn offset(self) -> (isize, isize) {
        match self {
            Self::Up => (-1, 0),
            Self::Right => (0, 1),
            Self::Down => (1, 0),
            Self::Left => (0, -1),
        }
    }
}

/// Alien species a cabin can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlienType {
    /// Boosts engine power.
    Brown,
    /// Boosts cannon power.
    Purple,
}

/// Good color, ordered by decreasing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoodColor {
    Red,
    Yellow,
    Green,
    Blue,
}

impl GoodColor {
    pub const ALL: [GoodColor; 4] = [Self::Red, Self::Yellow, Self::Green, Self::Blue];

    pub fn value(self) -> u32 {
        match self {
            Self::Red => 4,
            Self::Yellow => 3,
            Self::Green => 2,
            Self::Blue => 1,
        }
    }
}

/// Per-color good counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GoodsCount {
    pub red: u32,
    pub yellow: u32,
    pub green: u32,
    pub blue: u32,
}

impl GoodsCount {
    pub fn from_goods(goods: &[GoodColor]) -> Self {
        let mut count = Self::default();
        for good in goods {
            *count.get_mut(*good) += 1;
        }
        count
    }

    pub fn get(&self, color: GoodColor) -> u32 {
        match color {
            GoodColor::Red => self.red,
            GoodColor::Yellow => self.yellow,
            GoodColor::Green => self.green,
            GoodColor::Blue => self.blue,
        }
    }

    pub fn get_mut(&mut self, color: GoodColor) -> &mut u32 {
        match color {
            GoodColor::Red => &mut self.red,
            GoodColor::Yellow => &mut self.yellow,
            GoodColor::Green => &mut self.green,
            GoodColor::Blue => &mut self.blue,
        }
    }

    pub fn add(&mut self, other: &Self) {
        for color in GoodColor::ALL {
            *self.get_mut(color) += other.get(color);
        }
    }

    pub fn subtract(&mut self, other: &Self) {
        for color in GoodColor::ALL {
            let slot = self.get_mut(color);
            *slot = slot.saturating_sub(other.get(color));
        }
    }

    pub fn total(&self) -> u32 {
        self.red + self.yellow + self.green + self.blue
    }

    /// Credit value of the goods.
    pub fn value(&self) -> u32 {
        GoodColor::ALL.iter().map(|c| c.value() * self.get(*c)).sum()
    }
}

/// Typed payload of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentKind {
    Structural,
    Battery {
        capacity: u32,
        charge: u32,
    },
    Cabin {
        humans: u32,
        alien: Option<AlienType>,
        starting: bool,
    },
    Cannon {
        direction: Direction,
        double: bool,
    },
    Engine {
        direction: Direction,
        double: bool,
    },
    Cargo {
        capacity: usize,
        /// Special holds may carry red goods.
        special: bool,
        goods: Vec<GoodColor>,
    },
    Shield {
        directions: [Direction; 2],
    },
    AlienSupport {
        alien: AlienType,
    },
}

/// A ship component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    connectors: [ConnectorType; 4],
    pub kind: ComponentKind,
    /// Dashboard cell, once placed
    pub position: Option<Position>,
    /// Welded to the dashboard
    pub inserted: bool,
    /// Revealed to every player
    pub shown: bool,
    /// Clockwise quarter turns applied so far
    pub rotation: u8,
}

impl Component {
    pub fn new(id: u32, connectors: [ConnectorType; 4], kind: ComponentKind) -> Self {
        Self {
            id: ComponentId(id),
            connectors,
            kind,
            position: None,
            inserted: false,
            shown: false,
            rotation: 0,
        }
    }

    pub fn structural(id: u32, connectors: [ConnectorType; 4]) -> Self {
        Self::new(id, connectors, ComponentKind::Structural)
    }

    /// Batteries come fully charged.
    pub fn battery(id: u32, connectors: [ConnectorType; 4], capacity: u32) -> Self {
        Self::new(
            id,
            connectors,
            ComponentKind::Battery {
                capacity,
                charge: capacity,
            },
        )
    }

    pub fn cabin(id: u32, connectors: [ConnectorType; 4]) -> Self {
        Self::new(
            id,
            connectors,
            ComponentKind::Cabin {
                humans: 0,
                alien: None,
                starting: false,
            },
        )
    }

    /// Starting cabin: universal on every side and already revealed.
    pub fn starting_cabin(id: u32) -> Self {
        let mut cabin = Self::new(
            id,
            [ConnectorType::Universal; 4],
            ComponentKind::Cabin {
                humans: 0,
                alien: None,
                starting: true,
            },
        );
        cabin.shown = true;
        cabin
    }

    pub fn cannon(id: u32, connectors: [ConnectorType; 4], double: bool) -> Self {
        Self::new(
            id,
            connectors,
            ComponentKind::Cannon {
                direction: Direction::Up,
                double,
            },
        )
    }

    pub fn engine(id: u32, connectors: [ConnectorType; 4], double: bool) -> Self {
        Self::new(
            id,
            connectors,
            ComponentKind::Engine {
                direction: Direction::Down,
                double,
            },
        )
    }

    pub fn cargo(id: u32, connectors: [ConnectorType; 4], capacity: usize, special: bool) -> Self {
        Self::new(
            id,
            connectors,
            ComponentKind::Cargo {
                capacity,
                special,
                goods: Vec::new(),
            },
        )
    }

    pub fn shield(id: u32, connectors: [ConnectorType; 4]) -> Self {
        Self::new(
            id,
            connectors,
            ComponentKind::Shield {
                directions: [Direction::Up, Direction::Right],
            },
        )
    }

    pub fn alien_support(id: u32, connectors: [ConnectorType; 4], alien: AlienType) -> Self {
        Self::new(id, connectors, ComponentKind::AlienSupport { alien })
    }

    pub fn connectors(&self) -> &[ConnectorType; 4] {
        &self.connectors
    }

    pub fn connector(&self, side: Direction) -> ConnectorType {
        self.connectors[side.index()]
    }

    /// Rotate by `times` quarter turns, clockwise when positive.
    ///
    /// Returns false when the rotation is a multiple of four and nothing changed.
    pub fn rotate(&mut self, times: i32) -> bool {
        let turns = times.rem_euclid(4) as u8;
        if turns == 0 {
            return false;
        }
        self.connectors.rotate_right(turns as usize);
        match &mut self.kind {
            ComponentKind::Cannon { direction, .. } | ComponentKind::Engine { direction, .. } => {
                *direction = direction.rotated(turns);
            }
            ComponentKind::Shield { directions } => {
                for direction in directions.iter_mut() {
                    *direction = direction.rotated(turns);
                }
            }
            _ => {}
        }
        self.rotation = (self.rotation + turns) % 4;
        true
    }

    /// Crew units carried.
    pub fn crew(&self) -> u32 {
        match &self.kind {
            ComponentKind::Cabin { humans, alien, .. } => {
                humans + if alien.is_some() { ALIEN_CREW } else { 0 }
            }
            _ => 0,
        }
    }

    /// Crew members carried, an alien being one member.
    pub fn crew_members(&self) -> u32 {
        match &self.kind {
            ComponentKind::Cabin { humans, alien, .. } => humans + u32::from(alien.is_some()),
            _ => 0,
        }
    }

    pub fn charge(&self) -> u32 {
        match &self.kind {
            ComponentKind::Battery { charge, .. } => *charge,
            _ => 0,
        }
    }

    pub fn goods(&self) -> GoodsCount {
        match &self.kind {
            ComponentKind::Cargo { goods, .. } => GoodsCount::from_goods(goods),
            _ => GoodsCount::default(),
        }
    }

    pub fn supported_alien(&self) -> Option<AlienType> {
        match &self.kind {
            ComponentKind::AlienSupport { alien } => Some(*alien),
            _ => None,
        }
    }

    pub fn is_cabin(&self) -> bool {
        matches!(self.kind, ComponentKind::Cabin { .. })
    }

    pub fn hosted_alien(&self) -> Option<AlienType> {
        match &self.kind {
            ComponentKind::Cabin { alien, .. } => *alien,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ConnectorType::*;

    #[test]
    fn test_compatibility_table() {
        assert!(Universal.compatible(Universal));
        assert!(Single.compatible(Single));
        assert!(Double.compatible(Double));
        assert!(Single.compatible(Universal));
        assert!(Universal.compatible(Double));
        assert!(!Single.compatible(Double));
        assert!(!Empty.compatible(Empty));
        assert!(!Empty.compatible(Universal));
        assert!(!Universal.compatible(Empty));
    }

    #[test]
    fn test_compatibility_is_symmetric() {
        let all = [Empty, Single, Double, Universal];
        for a in all {
            for b in all {
                assert_eq!(a.compatible(b), b.compatible(a), "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_rotate_clockwise_shifts_last_to_first() {
        let mut c = Component::structural(1, [Universal, Single, Double, Empty]);
        assert!(c.rotate(1));
        assert_eq!(*c.connectors(), [Empty, Universal, Single, Double]);
        assert_eq!(c.rotation, 1);

        assert!(c.rotate(-1));
        assert_eq!(*c.connectors(), [Universal, Single, Double, Empty]);
        assert_eq!(c.rotation, 0);
    }

    #[test]
    fn test_rotate_four_times_is_noop() {
        let mut cannon = Component::cannon(2, [Single, Empty, Double, Universal], true);
        let before = cannon.clone();
        assert!(!cannon.rotate(4));
        assert!(!cannon.rotate(-8));
        assert_eq!(cannon, before);

        for _ in 0..4 {
            cannon.rotate(1);
        }
        assert_eq!(cannon, before);
    }

    #[test]
    fn test_rotate_turns_direction_in_lockstep() {
        let mut engine = Component::engine(3, [Single; 4], false);
        engine.rotate(1);
        assert!(matches!(
            engine.kind,
            ComponentKind::Engine {
                direction: Direction::Left,
                ..
            }
        ));

        let mut shield = Component::shield(4, [Single; 4]);
        shield.rotate(2);
        assert!(matches!(
            shield.kind,
            ComponentKind::Shield {
                directions: [Direction::Down, Direction::Left]
            }
        ));
    }

    #[test]
    fn test_goods_count() {
        let goods = GoodsCount::from_goods(&[GoodColor::Red, GoodColor::Blue, GoodColor::Blue]);
        assert_eq!(goods.total(), 3);
        assert_eq!(goods.value(), 6);

        let mut left = goods;
        left.subtract(&GoodsCount::from_goods(&[GoodColor::Blue]));
        assert_eq!(left.blue, 1);
    }

    #[test]
    fn test_crew_contribution() {
        let mut cabin = Component::cabin(5, [Single; 4]);
        assert_eq!(cabin.crew(), 0);
        cabin.kind = ComponentKind::Cabin {
            humans: 0,
            alien: Some(AlienType::Brown),
            starting: false,
        };
        assert_eq!(cabin.crew(), ALIEN_CREW);
        assert_eq!(cabin.crew_members(), 1);
    }

    #[test]
    fn test_supported_alien() {
        let support = Component::alien_support(6, [Single; 4], AlienType::Purple);
        assert_eq!(support.supported_alien(), Some(AlienType::Purple));
        assert_eq!(Component::cabin(7, [Single; 4]).supported_alien(), None);
    }
}
