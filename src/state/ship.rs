//! Ship dashboard and construction rules.
//!
//! A ship owns every component a player holds: the one in hand, the reserve
//! list, the dashboard grid and the discard pile. The crew, battery and goods
//! counters are updated by the same operation that places or removes a
//! component, so they always equal the sum over the dashboard.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::component::{
    AlienType, Component, ComponentId, ComponentKind, Direction, GoodColor, GoodsCount,
    ALIEN_CREW, CABIN_CAPACITY,
};
use super::error::{EngineError, Resource};
use super::event::{Event, EventCollector, EventPayload};

/// Dashboard rows.
pub const ROWS: usize = 5;

/// Dashboard columns.
pub const COLS: usize = 7;

/// Cell of the starting cabin.
pub const STARTING_CELL: Position = Position { row: 2, col: 3 };

/// Components a player may keep aside while building.
pub const MAX_RESERVE: usize = 2;

const LEARNER_MASK: [&str; ROWS] = ["...X...", "..XXX..", ".XXXXX.", ".XXXXX.", ".XX.XX."];

const FULL_MASK: [&str; ROWS] = ["..X.X..", ".XXXXX.", "XXXXXXX", "XXXXXXX", "XXX.XXX"];

/// Game mode, fixed for the whole match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Smaller ship, no hourglass, no card piles
    #[default]
    Learner,
    Full,
}

impl GameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Learner => "learner",
            Self::Full => "full",
        }
    }

    /// Whether a component may be placed on this cell.
    pub fn is_playable(&self, pos: Position) -> bool {
        let mask = match self {
            Self::Learner => &LEARNER_MASK,
            Self::Full => &FULL_MASK,
        };
        mask.get(pos.row)
            .and_then(|row| row.as_bytes().get(pos.col))
            .is_some_and(|cell| *cell == b'X')
    }

    /// Cells on the flight circuit.
    pub fn circuit_length(&self) -> i64 {
        match self {
            Self::Learner => 18,
            Self::Full => 24,
        }
    }

    /// Starting cells by order of finishing the build.
    pub fn starting_offsets(&self) -> &'static [i64] {
        match self {
            Self::Learner => &[4, 2, 1, 0],
            Self::Full => &[6, 3, 1, 0],
        }
    }

    pub fn has_hourglass(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Credits by order of arrival.
    pub fn arrival_rewards(&self) -> &'static [u32] {
        match self {
            Self::Learner => &[4, 3, 2, 1],
            Self::Full => &[8, 6, 4, 2],
        }
    }

    /// Credits for the ship with the fewest exposed connectors.
    pub fn best_ship_reward(&self) -> u32 {
        match self {
            Self::Learner => 2,
            Self::Full => 4,
        }
    }
}

/// Dashboard cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

impl Position {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// Check if position is within the dashboard bounds.
    pub fn is_valid(&self) -> bool {
        self.row < ROWS && self.col < COLS
    }

    /// Orthogonal neighbor, if still on the dashboard.
    pub fn neighbor(&self, side: Direction) -> Option<Position> {
        let (dr, dc) = side.offset();
        let row = self.row.checked_add_signed(dr)?;
        let col = self.col.checked_add_signed(dc)?;
        let next = Position::new(row, col);
        next.is_valid().then_some(next)
    }
}

/// Cells a projectile coming from `from` crosses along `line`, nearest first.
pub fn line_cells(from: Direction, line: usize) -> Vec<Position> {
    match from {
        Direction::Up => (0..ROWS).map(|r| Position::new(r, line)).collect(),
        Direction::Down => (0..ROWS).rev().map(|r| Position::new(r, line)).collect(),
        Direction::Left => (0..COLS).map(|c| Position::new(line, c)).collect(),
        Direction::Right => (0..COLS).rev().map(|c| Position::new(line, c)).collect(),
    }
}

/// A player's ship.
#[derive(Debug, Clone)]
pub struct Ship {
    owner: String,
    mode: GameMode,
    dashboard: [[Option<ComponentId>; COLS]; ROWS],
    components: HashMap<ComponentId, Component>,
    hand: Option<ComponentId>,
    reserve: Vec<ComponentId>,
    discard: Vec<ComponentId>,
    crew: u32,
    batteries: u32,
    goods: GoodsCount,
}

impl Ship {
    /// Create an empty ship.
    pub fn new(owner: impl Into<String>, mode: GameMode) -> Self {
        Self {
            owner: owner.into(),
            mode,
            dashboard: [[None; COLS]; ROWS],
            components: HashMap::new(),
            hand: None,
            reserve: Vec::new(),
            discard: Vec::new(),
            crew: 0,
            batteries: 0,
            goods: GoodsCount::default(),
        }
    }

    /// Rebuild a ship from stored components; counters are recomputed.
    pub fn restore(
        owner: impl Into<String>,
        mode: GameMode,
        components: Vec<Component>,
        hand: Option<ComponentId>,
        reserve: Vec<ComponentId>,
        discard: Vec<ComponentId>,
    ) -> Self {
        let mut ship = Self::new(owner, mode);
        for component in components {
            if let Some(pos) = component.position {
                ship.set_cell(pos, Some(component.id));
            }
            ship.components.insert(component.id, component);
        }
        ship.hand = hand;
        ship.reserve = reserve;
        ship.discard = discard;
        let (crew, batteries, goods) = ship.recount();
        ship.crew = crew;
        ship.batteries = batteries;
        ship.goods = goods;
        ship
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    pub fn crew(&self) -> u32 {
        self.crew
    }

    pub fn batteries(&self) -> u32 {
        self.batteries
    }

    pub fn goods(&self) -> GoodsCount {
        self.goods
    }

    /// Crew members on board, an alien counting once.
    pub fn crew_members(&self) -> u32 {
        self.placed().map(Component::crew_members).sum()
    }

    pub fn hand(&self) -> Option<ComponentId> {
        self.hand
    }

    pub fn reserve(&self) -> &[ComponentId] {
        &self.reserve
    }

    pub fn discard(&self) -> &[ComponentId] {
        &self.discard
    }

    pub fn component(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(&id)
    }

    /// Every component the player holds, wherever it is.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    /// Component on a dashboard cell.
    pub fn at(&self, pos: Position) -> Option<&Component> {
        self.cell(pos).and_then(|id| self.components.get(&id))
    }

    /// Dashboard components in row-major order.
    pub fn placed(&self) -> impl Iterator<Item = &Component> {
        self.dashboard
            .iter()
            .flatten()
            .filter_map(|id| id.and_then(|id| self.components.get(&id)))
    }

    pub fn placed_count(&self) -> usize {
        self.dashboard.iter().flatten().filter(|c| c.is_some()).count()
    }

    /// Dashboard as rows of component ids.
    pub fn dashboard_ids(&self) -> Vec<Vec<Option<ComponentId>>> {
        self.dashboard.iter().map(|row| row.to_vec()).collect()
    }

    /// Sum of crew, charge and goods over the dashboard.
    pub fn recount(&self) -> (u32, u32, GoodsCount) {
        let mut goods = GoodsCount::default();
        let mut crew = 0;
        let mut batteries = 0;
        for component in self.placed() {
            crew += component.crew();
            batteries += component.charge();
            goods.add(&component.goods());
        }
        (crew, batteries, goods)
    }

    fn cell(&self, pos: Position) -> Option<ComponentId> {
        self.dashboard
            .get(pos.row)
            .and_then(|row| row.get(pos.col))
            .copied()
            .flatten()
    }

    fn set_cell(&mut self, pos: Position, value: Option<ComponentId>) {
        if let Some(cell) = self
            .dashboard
            .get_mut(pos.row)
            .and_then(|row| row.get_mut(pos.col))
        {
            *cell = value;
        }
    }

    fn placed_component(&self, id: ComponentId) -> Result<&Component, EngineError> {
        self.components
            .get(&id)
            .filter(|c| c.position.is_some())
            .ok_or_else(|| EngineError::component(id))
    }

    fn is_free_cell(&self, pos: Position, ignore: Option<ComponentId>) -> bool {
        self.mode.is_playable(pos) && (self.cell(pos).is_none() || self.cell(pos) == ignore)
    }

    // Hand and reserve

    /// Put a freshly picked component in hand.
    pub fn take_in_hand(&mut self, component: Component) -> Result<(), EngineError> {
        if self.hand.is_some() {
            return Err(EngineError::InvalidArgument("hand already holds a component"));
        }
        self.hand = Some(component.id);
        self.components.insert(component.id, component);
        Ok(())
    }

    /// Give the component in hand back to the shared pool.
    pub fn release_hand(&mut self) -> Result<Component, EngineError> {
        let id = self
            .hand
            .ok_or(EngineError::InvalidArgument("hand is empty"))?;
        let component = self
            .components
            .remove(&id)
            .ok_or_else(|| EngineError::component(id))?;
        self.hand = None;
        Ok(component)
    }

    /// Move the component in hand to the reserve.
    pub fn reserve_hand(&mut self) -> Result<ComponentId, EngineError> {
        let id = self
            .hand
            .ok_or(EngineError::InvalidArgument("hand is empty"))?;
        if self.reserve.len() >= MAX_RESERVE {
            return Err(EngineError::InvalidArgument("reserve is full"));
        }
        self.hand = None;
        self.reserve.push(id);
        Ok(id)
    }

    /// Discard whatever is still in hand or reserve; returns the lost ids.
    pub fn discard_unplaced(&mut self) -> Vec<ComponentId> {
        let mut lost: Vec<ComponentId> = self.hand.take().into_iter().collect();
        lost.append(&mut self.reserve);
        self.discard.extend(lost.iter().copied());
        lost
    }

    /// Weld every component on the dashboard.
    pub fn weld_all(&mut self) {
        for component in self.components.values_mut() {
            if component.position.is_some() {
                component.inserted = true;
            }
        }
    }

    // Construction

    /// Place a component from hand or reserve on the dashboard.
    pub fn insert(
        &mut self,
        id: ComponentId,
        pos: Position,
        rotation: i32,
        weld: bool,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let from_hand = self.hand == Some(id);
        if !from_hand && !self.reserve.contains(&id) {
            return Err(EngineError::component(id));
        }
        let component = self
            .components
            .get(&id)
            .ok_or_else(|| EngineError::component(id))?;
        if !self.is_free_cell(pos, None) {
            return Err(EngineError::PositionInvalid {
                row: pos.row,
                col: pos.col,
            });
        }
        if !component.shown {
            return Err(EngineError::ComponentNotVisible(id));
        }
        let mut candidate = component.clone();
        candidate.rotate(rotation);
        self.check_neighbors(&candidate, pos, None)?;

        if from_hand {
            self.hand = None;
        } else {
            self.reserve.retain(|r| *r != id);
        }
        candidate.position = Some(pos);
        candidate.inserted = weld;
        self.components.insert(id, candidate);
        self.set_cell(pos, Some(id));
        self.affect_insert(id);

        if let Some(component) = self.components.get(&id) {
            events.emit(Event::all(
                &self.owner,
                EventPayload::ComponentInserted {
                    player: self.owner.clone(),
                    component: component.clone(),
                    row: pos.row,
                    col: pos.col,
                },
            ));
        }
        self.emit_aggregates(events);
        Ok(())
    }

    /// Move a placed but unwelded component to another cell.
    pub fn move_component(
        &mut self,
        id: ComponentId,
        pos: Position,
        rotation: i32,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let component = self.placed_component(id)?;
        if component.inserted {
            return Err(EngineError::AlreadyWelded(id));
        }
        let Some(old) = component.position else {
            return Err(EngineError::component(id));
        };
        if !self.is_free_cell(pos, Some(id)) {
            return Err(EngineError::PositionInvalid {
                row: pos.row,
                col: pos.col,
            });
        }
        let mut candidate = component.clone();
        candidate.rotate(rotation);
        self.check_neighbors(&candidate, pos, Some(id))?;

        self.set_cell(old, None);
        candidate.position = Some(pos);
        let rotation = candidate.rotation;
        self.components.insert(id, candidate);
        self.set_cell(pos, Some(id));

        events.emit(Event::all(
            &self.owner,
            EventPayload::ComponentMoved {
                player: self.owner.clone(),
                component: id,
                row: pos.row,
                col: pos.col,
                rotation,
            },
        ));
        Ok(())
    }

    /// Rotate a component held in hand or reserve.
    pub fn rotate_held(
        &mut self,
        id: ComponentId,
        times: i32,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        if self.hand != Some(id) && !self.reserve.contains(&id) {
            return match self.components.get(&id) {
                Some(c) if c.inserted => Err(EngineError::AlreadyWelded(id)),
                Some(_) => Err(EngineError::InvalidArgument(
                    "placed components are rotated by moving them",
                )),
                None => Err(EngineError::component(id)),
            };
        }
        let component = self
            .components
            .get_mut(&id)
            .ok_or_else(|| EngineError::component(id))?;
        if component.rotate(times) {
            events.emit(Event::all(
                &self.owner,
                EventPayload::ComponentRotated {
                    player: self.owner.clone(),
                    component: id,
                    rotation: component.rotation,
                },
            ));
        }
        Ok(())
    }

    /// Remove a component from the dashboard into the discard pile.
    pub fn destroy(
        &mut self,
        id: ComponentId,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let pos = self
            .placed_component(id)?
            .position
            .ok_or_else(|| EngineError::component(id))?;
        self.remove_from_dashboard(id, pos, events);
        events.emit(Event::all(
            &self.owner,
            EventPayload::ComponentDestroyed {
                player: self.owner.clone(),
                component: id,
            },
        ));
        self.emit_aggregates(events);
        Ok(())
    }

    fn check_neighbors(
        &self,
        candidate: &Component,
        pos: Position,
        ignore: Option<ComponentId>,
    ) -> Result<(), EngineError> {
        let mut neighbors = 0;
        let mut mismatch = false;
        for side in Direction::ALL {
            let Some(other) = pos
                .neighbor(side)
                .and_then(|next| self.cell(next))
                .filter(|other| Some(*other) != ignore)
                .and_then(|other| self.components.get(&other))
            else {
                continue;
            };
            neighbors += 1;
            if !candidate
                .connector(side)
                .compatible(other.connector(side.opposite()))
            {
                mismatch = true;
            }
        }

        let others = self
            .placed()
            .filter(|c| Some(c.id) != ignore)
            .count();
        if neighbors == 0 && others > 0 {
            return Err(EngineError::IsolatedPlacement(candidate.id));
        }
        if mismatch {
            return Err(EngineError::ConnectorMismatch(candidate.id));
        }
        Ok(())
    }

    fn affect_insert(&mut self, id: ComponentId) {
        let Some(component) = self.components.get_mut(&id) else {
            return;
        };
        if let ComponentKind::Cabin {
            humans,
            alien: None,
            ..
        } = &mut component.kind
        {
            *humans = CABIN_CAPACITY;
        }
        self.crew += component.crew();
        self.batteries += component.charge();
        self.goods.add(&component.goods());
    }

    fn remove_from_dashboard(
        &mut self,
        id: ComponentId,
        pos: Position,
        events: &mut EventCollector,
    ) {
        self.set_cell(pos, None);
        let Some(component) = self.components.get_mut(&id) else {
            return;
        };
        component.position = None;
        let support = component.supported_alien();
        self.crew = self.crew.saturating_sub(component.crew());
        self.batteries = self.batteries.saturating_sub(component.charge());
        self.goods.subtract(&component.goods());
        self.discard.push(id);

        if let Some(alien) = support {
            self.drop_unsupported_aliens(pos, alien, events);
        }
    }

    /// Evict aliens of `alien` type next to `pos` that lost their last support.
    fn drop_unsupported_aliens(
        &mut self,
        pos: Position,
        alien: AlienType,
        events: &mut EventCollector,
    ) {
        for side in Direction::ALL {
            let Some((cabin_pos, cabin_id)) = pos
                .neighbor(side)
                .and_then(|next| self.cell(next).map(|id| (next, id)))
            else {
                continue;
            };
            let hosts = self
                .components
                .get(&cabin_id)
                .and_then(Component::hosted_alien)
                == Some(alien);
            if !hosts || self.has_adjacent_support(cabin_pos, alien) {
                continue;
            }
            if let Some(ComponentKind::Cabin { alien: hosted, .. }) =
                self.components.get_mut(&cabin_id).map(|c| &mut c.kind)
            {
                *hosted = None;
            }
            self.crew = self.crew.saturating_sub(ALIEN_CREW);
            self.emit_component(cabin_id, events);
        }
    }

    fn has_adjacent_support(&self, pos: Position, alien: AlienType) -> bool {
        Direction::ALL.iter().any(|side| {
            pos.neighbor(*side)
                .and_then(|next| self.at(next))
                .and_then(Component::supported_alien)
                == Some(alien)
        })
    }

    // Structure

    /// Groups of orthogonally connected components.
    pub fn broken_parts(&self) -> Vec<Vec<ComponentId>> {
        let mut seen = HashSet::new();
        let mut parts = Vec::new();
        for row in 0..ROWS {
            for col in 0..COLS {
                let start = Position::new(row, col);
                if self.cell(start).is_none() || !seen.insert(start) {
                    continue;
                }
                let mut part = Vec::new();
                let mut queue = VecDeque::from([start]);
                while let Some(pos) = queue.pop_front() {
                    if let Some(id) = self.cell(pos) {
                        part.push(id);
                    }
                    for side in Direction::ALL {
                        if let Some(next) = pos.neighbor(side) {
                            if self.cell(next).is_some() && seen.insert(next) {
                                queue.push_back(next);
                            }
                        }
                    }
                }
                parts.push(part);
            }
        }
        parts
    }

    /// Keep one part of a broken ship and discard the rest.
    pub fn keep_part(
        &mut self,
        parts: &[Vec<ComponentId>],
        index: usize,
        events: &mut EventCollector,
    ) -> Result<Vec<ComponentId>, EngineError> {
        if index >= parts.len() {
            return Err(EngineError::InvalidArgument("no such ship part"));
        }
        let discarded: Vec<ComponentId> = parts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .flat_map(|(_, part)| part.iter().copied())
            .collect();
        for id in &discarded {
            if let Some(pos) = self.components.get(id).and_then(|c| c.position) {
                self.remove_from_dashboard(*id, pos, events);
            }
        }
        events.emit(Event::all(
            &self.owner,
            EventPayload::ShipPartKept {
                player: self.owner.clone(),
                part: index,
                discarded: discarded.clone(),
            },
        ));
        self.emit_aggregates(events);
        Ok(discarded)
    }

    fn blocked(&self, pos: Position, side: Direction) -> bool {
        pos.neighbor(side).and_then(|next| self.cell(next)).is_some()
    }

    /// Components placed against the flight rules.
    ///
    /// Engines must face down with nothing behind them; cannons need a free
    /// cell in front.
    pub fn check_errors(&self) -> Vec<ComponentId> {
        self.placed()
            .filter(|c| {
                let Some(pos) = c.position else {
                    return false;
                };
                match c.kind {
                    ComponentKind::Engine { direction, .. } => {
                        direction != Direction::Down || self.blocked(pos, Direction::Down)
                    }
                    ComponentKind::Cannon { direction, .. } => self.blocked(pos, direction),
                    _ => false,
                }
            })
            .map(|c| c.id)
            .collect()
    }

    /// Non-empty connectors facing an empty cell or the dashboard edge.
    pub fn exposed_connectors(&self) -> u32 {
        let mut exposed = 0;
        for component in self.placed() {
            let Some(pos) = component.position else {
                continue;
            };
            for side in Direction::ALL {
                if !component.connector(side).is_empty() && !self.blocked(pos, side) {
                    exposed += 1;
                }
            }
        }
        exposed
    }

    // Aliens

    pub fn has_alien(&self, alien: AlienType) -> bool {
        self.placed().any(|c| c.hosted_alien() == Some(alien))
    }

    /// Cabins that may still receive an alien, with the alien type.
    pub fn alien_candidates(&self) -> Vec<(ComponentId, AlienType)> {
        let mut candidates = Vec::new();
        for component in self.placed() {
            let (ComponentKind::Cabin {
                alien: None,
                starting: false,
                ..
            }, Some(pos)) = (&component.kind, component.position)
            else {
                continue;
            };
            for alien in [AlienType::Brown, AlienType::Purple] {
                if !self.has_alien(alien) && self.has_adjacent_support(pos, alien) {
                    candidates.push((component.id, alien));
                }
            }
        }
        candidates
    }

    /// Replace a cabin's humans with an alien.
    pub fn assign_alien(
        &mut self,
        cabin: ComponentId,
        alien: AlienType,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        if !self.alien_candidates().contains(&(cabin, alien)) {
            return Err(EngineError::InvalidArgument("cabin cannot host that alien"));
        }
        let component = self
            .components
            .get_mut(&cabin)
            .ok_or_else(|| EngineError::component(cabin))?;
        let before = component.crew();
        if let ComponentKind::Cabin {
            humans,
            alien: hosted,
            ..
        } = &mut component.kind
        {
            *humans = 0;
            *hosted = Some(alien);
        }
        self.crew = self.crew.saturating_sub(before) + component.crew();

        events.emit(Event::all(
            &self.owner,
            EventPayload::AlienAssigned {
                player: self.owner.clone(),
                cabin,
                alien,
            },
        ));
        self.emit_component(cabin, events);
        self.emit_aggregates(events);
        Ok(())
    }

    // Firepower and propulsion

    fn check_activation(
        &self,
        ids: &[ComponentId],
        wanted: impl Fn(&ComponentKind) -> bool,
    ) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                return Err(EngineError::InvalidArgument("component activated twice"));
            }
            if !wanted(&self.placed_component(*id)?.kind) {
                return Err(EngineError::InvalidArgument(
                    "component cannot be activated that way",
                ));
            }
        }
        Ok(())
    }

    /// Cannon strength with the given double cannons powered.
    pub fn cannon_power(&self, activated: &[ComponentId]) -> Result<f32, EngineError> {
        self.check_activation(activated, |k| {
            matches!(k, ComponentKind::Cannon { double: true, .. })
        })?;
        let mut power = 0.0;
        for component in self.placed() {
            if let ComponentKind::Cannon { direction, double } = component.kind {
                if double && !activated.contains(&component.id) {
                    continue;
                }
                let base = if double { 2.0 } else { 1.0 };
                power += if direction == Direction::Up {
                    base
                } else {
                    base / 2.0
                };
            }
        }
        if power > 0.0 && self.has_alien(AlienType::Purple) {
            power += 2.0;
        }
        Ok(power)
    }

    /// Engine strength with the given double engines powered.
    pub fn engine_power(&self, activated: &[ComponentId]) -> Result<u32, EngineError> {
        self.check_activation(activated, |k| {
            matches!(k, ComponentKind::Engine { double: true, .. })
        })?;
        let mut power = 0;
        for component in self.placed() {
            if let ComponentKind::Engine { double, .. } = component.kind {
                if !double {
                    power += 1;
                } else if activated.contains(&component.id) {
                    power += 2;
                }
            }
        }
        if power > 0 && self.has_alien(AlienType::Brown) {
            power += 2;
        }
        Ok(power)
    }

    /// Whether a shield covers the given side.
    pub fn shielded(&self, side: Direction) -> bool {
        self.placed().any(|c| {
            matches!(&c.kind, ComponentKind::Shield { directions } if directions.contains(&side))
        })
    }

    /// First component hit by something travelling along a line.
    pub fn first_in_line(&self, from: Direction, line: usize) -> Option<ComponentId> {
        line_cells(from, line)
            .into_iter()
            .find_map(|pos| self.cell(pos))
    }

    /// Cannon on the line aimed at `from`; single cannons are preferred.
    pub fn cannon_in_line(&self, from: Direction, line: usize) -> Option<(ComponentId, bool)> {
        let mut found: Option<(ComponentId, bool)> = None;
        for pos in line_cells(from, line) {
            if let Some(ComponentKind::Cannon { direction, double }) =
                self.at(pos).map(|c| &c.kind)
            {
                if *direction != from {
                    continue;
                }
                let Some(id) = self.cell(pos) else {
                    continue;
                };
                if !double {
                    return Some((id, false));
                }
                found.get_or_insert((id, true));
            }
        }
        found
    }

    // Batteries

    /// Check that every listed battery can give one charge per listing.
    pub fn check_batteries(&self, batteries: &[ComponentId]) -> Result<(), EngineError> {
        let mut needed: HashMap<ComponentId, u32> = HashMap::new();
        for id in batteries {
            *needed.entry(*id).or_default() += 1;
        }
        for (id, count) in needed {
            match self.placed_component(id)?.kind {
                ComponentKind::Battery { charge, .. } if charge >= count => {}
                ComponentKind::Battery { .. } => {
                    return Err(EngineError::InsufficientResource(Resource::Batteries))
                }
                _ => return Err(EngineError::InvalidArgument("component is not a battery")),
            }
        }
        Ok(())
    }

    pub fn spend_batteries(
        &mut self,
        batteries: &[ComponentId],
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        self.check_batteries(batteries)?;
        for id in batteries {
            if let Some(ComponentKind::Battery { charge, .. }) =
                self.components.get_mut(id).map(|c| &mut c.kind)
            {
                *charge -= 1;
                self.batteries = self.batteries.saturating_sub(1);
            }
            self.emit_component(*id, events);
        }
        if !batteries.is_empty() {
            self.emit_aggregates(events);
        }
        Ok(())
    }

    // Crew

    /// Check that each listed cabin can give one member per listing.
    pub fn check_crew_removal(&self, cabins: &[ComponentId]) -> Result<(), EngineError> {
        let mut needed: HashMap<ComponentId, u32> = HashMap::new();
        for id in cabins {
            *needed.entry(*id).or_default() += 1;
        }
        for (id, count) in needed {
            let cabin = self.placed_component(id)?;
            if !cabin.is_cabin() {
                return Err(EngineError::InvalidArgument("component is not a cabin"));
            }
            if cabin.crew_members() < count {
                return Err(EngineError::InsufficientResource(Resource::Crew));
            }
        }
        Ok(())
    }

    /// Remove one crew member per listing; an alien leaves first.
    pub fn remove_crew(
        &mut self,
        cabins: &[ComponentId],
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        self.check_crew_removal(cabins)?;
        for id in cabins {
            if let Some(ComponentKind::Cabin { humans, alien, .. }) =
                self.components.get_mut(id).map(|c| &mut c.kind)
            {
                if alien.take().is_some() {
                    self.crew = self.crew.saturating_sub(ALIEN_CREW);
                } else if *humans > 0 {
                    *humans -= 1;
                    self.crew = self.crew.saturating_sub(1);
                }
            }
            self.emit_component(*id, events);
        }
        if !cabins.is_empty() {
            self.emit_aggregates(events);
        }
        Ok(())
    }

    /// One listing per crew member aboard, for losing the whole crew.
    pub fn all_crew(&self) -> Vec<ComponentId> {
        self.placed()
            .flat_map(|c| std::iter::repeat(c.id).take(c.crew_members() as usize))
            .collect()
    }

    /// Occupied cabins touching another occupied cabin.
    pub fn epidemic_victims(&self) -> Vec<ComponentId> {
        let occupied = |c: &Component| c.is_cabin() && c.crew_members() > 0;
        self.placed()
            .filter(|c| occupied(*c))
            .filter(|c| {
                c.position.is_some_and(|pos| {
                    Direction::ALL.iter().any(|side| {
                        pos.neighbor(*side)
                            .and_then(|next| self.at(next))
                            .is_some_and(occupied)
                    })
                })
            })
            .map(|c| c.id)
            .collect()
    }

    // Goods

    /// Validate new hold contents; returns `(gained, lost)` goods.
    ///
    /// Goods may move between the listed holds, be dropped, or be taken from
    /// `offered`.
    pub fn plan_goods(
        &self,
        updates: &[(ComponentId, Vec<GoodColor>)],
        offered: &[GoodColor],
    ) -> Result<(GoodsCount, GoodsCount), EngineError> {
        let mut seen = HashSet::new();
        let mut before = GoodsCount::default();
        let mut after = GoodsCount::default();
        for (id, goods) in updates {
            if !seen.insert(*id) {
                return Err(EngineError::InvalidArgument("cargo hold listed twice"));
            }
            let hold = self.placed_component(*id)?;
            let ComponentKind::Cargo {
                capacity, special, ..
            } = &hold.kind
            else {
                return Err(EngineError::InvalidArgument("component is not a cargo hold"));
            };
            if goods.len() > *capacity {
                return Err(EngineError::InsufficientResource(Resource::Cargo));
            }
            if !special && goods.contains(&GoodColor::Red) {
                return Err(EngineError::InvalidArgument("red goods need a special hold"));
            }
            before.add(&hold.goods());
            after.add(&GoodsCount::from_goods(goods));
        }

        let offered = GoodsCount::from_goods(offered);
        let mut gained = GoodsCount::default();
        let mut lost = GoodsCount::default();
        for color in GoodColor::ALL {
            let (had, has) = (before.get(color), after.get(color));
            if has > had {
                if has - had > offered.get(color) {
                    return Err(EngineError::InsufficientResource(Resource::Goods));
                }
                *gained.get_mut(color) = has - had;
            } else {
                *lost.get_mut(color) = had - has;
            }
        }
        Ok((gained, lost))
    }

    /// Apply new hold contents validated by [`Ship::plan_goods`].
    pub fn update_goods(
        &mut self,
        updates: &[(ComponentId, Vec<GoodColor>)],
        offered: &[GoodColor],
        events: &mut EventCollector,
    ) -> Result<(GoodsCount, GoodsCount), EngineError> {
        let (gained, lost) = self.plan_goods(updates, offered)?;
        for (id, goods) in updates {
            if let Some(ComponentKind::Cargo { goods: held, .. }) =
                self.components.get_mut(id).map(|c| &mut c.kind)
            {
                *held = goods.clone();
            }
            self.emit_component(*id, events);
        }
        self.goods.add(&gained);
        self.goods.subtract(&lost);
        self.emit_aggregates(events);
        Ok((gained, lost))
    }

    /// The `count` most valuable goods aboard.
    pub fn most_valuable(&self, count: u32) -> GoodsCount {
        let mut left = count;
        let mut taken = GoodsCount::default();
        for color in GoodColor::ALL {
            let n = self.goods.get(color).min(left);
            *taken.get_mut(color) = n;
            left -= n;
        }
        taken
    }

    /// Lose `count` goods, most valuable first, then batteries for the rest.
    pub fn forfeit(&mut self, count: u32, events: &mut EventCollector) {
        let mut left = count;
        let holds: Vec<ComponentId> = self
            .placed()
            .filter(|c| matches!(c.kind, ComponentKind::Cargo { .. }))
            .map(|c| c.id)
            .collect();
        let batteries: Vec<ComponentId> = self
            .placed()
            .filter(|c| c.charge() > 0)
            .map(|c| c.id)
            .collect();

        for color in GoodColor::ALL {
            for id in &holds {
                while left > 0 {
                    let Some(ComponentKind::Cargo { goods, .. }) =
                        self.components.get_mut(id).map(|c| &mut c.kind)
                    else {
                        break;
                    };
                    let Some(index) = goods.iter().position(|g| *g == color) else {
                        break;
                    };
                    goods.remove(index);
                    *self.goods.get_mut(color) = self.goods.get(color).saturating_sub(1);
                    left -= 1;
                    self.emit_component(*id, events);
                }
            }
        }
        for id in &batteries {
            while left > 0 {
                let Some(ComponentKind::Battery { charge, .. }) =
                    self.components.get_mut(id).map(|c| &mut c.kind)
                else {
                    break;
                };
                if *charge == 0 {
                    break;
                }
                *charge -= 1;
                self.batteries = self.batteries.saturating_sub(1);
                left -= 1;
                self.emit_component(*id, events);
            }
        }
        self.emit_aggregates(events);
    }

    // Events

    fn emit_component(&self, id: ComponentId, events: &mut EventCollector) {
        if let Some(component) = self.components.get(&id) {
            events.emit(Event::all(
                &self.owner,
                EventPayload::ComponentUpdated {
                    player: self.owner.clone(),
                    component: component.clone(),
                },
            ));
        }
    }

    fn emit_aggregates(&self, events: &mut EventCollector) {
        let player = self.owner.clone();
        events.emit(Event::all(
            &self.owner,
            EventPayload::CrewUpdated {
                player: player.clone(),
                crew: self.crew,
            },
        ));
        events.emit(Event::all(
            &self.owner,
            EventPayload::BatteriesUpdated {
                player: player.clone(),
                batteries: self.batteries,
            },
        ));
        events.emit(Event::all(
            &self.owner,
            EventPayload::GoodsUpdated {
                player,
                goods: self.goods,
            },
        ));
    }
}
