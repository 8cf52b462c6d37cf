//! Flight encounters.
//!
//! The leader draws a card and the flying players then face it one at a
//! time, leader first. Each player's turn either resolves on the spot or
//! parks the player in a `WAIT_*` phase until the matching command arrives.

use std::collections::VecDeque;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::card::{Card, CardKind, Meteor, MeteorSize};
use super::component::{ComponentId, ComponentKind, Direction, GoodColor};
use super::error::EngineError;
use super::event::{Event, EventCollector, EventPayload, Outcome, RetireReason};
use super::game::{Game, GamePhase};
use super::player::PlayerState;
use super::ship::{line_cells, COLS, ROWS};

/// The card being resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    pub card: Card,
    /// Players still to face the card, leader first
    pub queue: VecDeque<String>,
    pub current: Option<String>,
    /// Meteor of the swarm being resolved
    pub meteor: usize,
    /// Line hit by the current meteor; `None` when it misses the dashboard
    pub line: Option<usize>,
    /// Player landed on each planet
    pub landings: Vec<Option<String>>,
    /// Goods the current player may load
    pub offered: Vec<GoodColor>,
    /// Goods or crew the current player owes
    pub penalty: u32,
    /// Someone claimed the reward; nobody else faces the card
    pub closed: bool,
}

impl Encounter {
    pub fn new(card: Card, queue: VecDeque<String>) -> Self {
        let landings = match &card.kind {
            CardKind::Planets { planets, .. } => vec![None; planets.len()],
            _ => Vec::new(),
        };
        Self {
            card,
            queue,
            current: None,
            meteor: 0,
            line: None,
            landings,
            offered: Vec::new(),
            penalty: 0,
            closed: false,
        }
    }

    pub fn current_meteor(&self) -> Option<Meteor> {
        match &self.card.kind {
            CardKind::MeteorSwarm { meteors } => meteors.get(self.meteor).copied(),
            _ => None,
        }
    }
}

/// Dashboard line a meteor follows for a two-dice roll.
///
/// Meteors from above or below travel along a column, the others along a
/// row; rolls that fall outside the dashboard miss.
pub fn meteor_line(from: Direction, roll: u8) -> Option<usize> {
    let (offset, lines) = match from {
        Direction::Up | Direction::Down => (4, COLS),
        Direction::Left | Direction::Right => (5, ROWS),
    };
    let line = usize::from(roll).checked_sub(offset)?;
    (line < lines).then_some(line)
}

enum Turn {
    Prompt(PlayerState),
    Meteor(Meteor, Option<usize>),
    Skip,
}

enum Penalty {
    Goods(u32),
    Crew(u32),
}

impl Game {
    fn outcome(&self, player: &str, outcome: Outcome, events: &mut EventCollector) {
        events.emit(Event::all(
            player,
            EventPayload::EncounterOutcome {
                player: player.to_string(),
                outcome,
            },
        ));
    }

    /// Require `state` and an encounter in progress.
    fn require_encounter(
        &self,
        player: &str,
        allowed: &[PlayerState],
    ) -> Result<(PlayerState, &Encounter), EngineError> {
        let state = self.phases.require(player, allowed)?;
        let encounter = self
            .encounter
            .as_ref()
            .ok_or(EngineError::IllegalPhase(state))?;
        Ok((state, encounter))
    }

    pub(crate) fn draw_card(
        &mut self,
        player: &str,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let state = self.phases.require(player, &[PlayerState::DrawCard])?;
        if self.phase != GamePhase::Flight || self.encounter.is_some() {
            return Err(EngineError::IllegalPhase(state));
        }
        let Some(card) = self.deck.pop() else {
            return self.end_game(events);
        };
        debug!(game = %self.id, player, card = card.id, kind = card.kind.as_str(), "card drawn");
        events.emit(Event::all(
            player,
            EventPayload::CardDrawn {
                player: player.to_string(),
                card: card.clone(),
                remaining: self.deck.len(),
            },
        ));
        self.phases.set(player, PlayerState::Wait, events);

        let order = self.flight.order();
        match card.kind.clone() {
            CardKind::Stardust => {
                for flyer in order.iter().rev() {
                    let exposed = i64::from(self.ship(flyer)?.exposed_connectors());
                    if exposed > 0 {
                        self.move_player(flyer, -exposed, events)?;
                    }
                    self.outcome(flyer, Outcome::Moved { steps: -exposed }, events);
                }
                self.encounter = Some(Encounter::new(card, VecDeque::new()));
                self.finish_encounter(events)
            }
            CardKind::Epidemic => {
                for flyer in &order {
                    let victims = self.ship(flyer)?.epidemic_victims();
                    self.ship_mut(flyer)?.remove_crew(&victims, events)?;
                }
                self.encounter = Some(Encounter::new(card, VecDeque::new()));
                self.finish_encounter(events)
            }
            CardKind::MeteorSwarm { meteors } if !meteors.is_empty() => {
                self.encounter = Some(Encounter::new(card, VecDeque::new()));
                self.phases.set(player, PlayerState::WaitRollDices, events);
                Ok(())
            }
            _ => {
                self.encounter = Some(Encounter::new(card, order.into()));
                self.next_turn(events)
            }
        }
    }

    /// Hand the card to the next player who has something to do.
    pub(crate) fn next_turn(&mut self, events: &mut EventCollector) -> Result<(), EngineError> {
        loop {
            let Some(encounter) = self.encounter.as_mut() else {
                return Ok(());
            };
            encounter.current = None;
            encounter.offered.clear();
            encounter.penalty = 0;
            let next = if encounter.closed {
                None
            } else {
                encounter.queue.pop_front()
            };
            let Some(player) = next else {
                return self.conclude_card(events);
            };
            encounter.current = Some(player.clone());
            if self.prompt(&player, events)? {
                return Ok(());
            }
        }
    }

    /// Start a player's turn; true when they must answer a prompt.
    fn prompt(&mut self, player: &str, events: &mut EventCollector) -> Result<bool, EngineError> {
        let Some(encounter) = self.encounter.as_ref() else {
            return Ok(false);
        };
        let ship = self.ship(player)?;
        let turn = match &encounter.card.kind {
            CardKind::OpenSpace => Turn::Prompt(PlayerState::WaitEngines),
            CardKind::Planets { .. } if encounter.landings.iter().any(Option::is_none) => {
                Turn::Prompt(PlayerState::WaitIndex)
            }
            CardKind::AbandonedShip { crew, .. } | CardKind::AbandonedStation { crew, .. }
                if ship.crew_members() >= *crew =>
            {
                Turn::Prompt(PlayerState::WaitBoolean)
            }
            CardKind::Smugglers { .. } | CardKind::Slavers { .. } => {
                Turn::Prompt(PlayerState::WaitCannons)
            }
            CardKind::MeteorSwarm { .. } => match encounter.current_meteor() {
                Some(meteor) => Turn::Meteor(meteor, encounter.line),
                None => Turn::Skip,
            },
            _ => Turn::Skip,
        };

        match turn {
            Turn::Prompt(state) => {
                self.phases.set(player, state, events);
                Ok(true)
            }
            Turn::Meteor(meteor, line) => self.meteor_strike(player, meteor, line, events),
            Turn::Skip => Ok(false),
        }
    }

    fn meteor_strike(
        &mut self,
        player: &str,
        meteor: Meteor,
        line: Option<usize>,
        events: &mut EventCollector,
    ) -> Result<bool, EngineError> {
        let ship = self.ship(player)?;
        let target = line.and_then(|l| ship.first_in_line(meteor.from, l).map(|id| (l, id)));
        let Some((line, target)) = target else {
            self.outcome(player, Outcome::Missed, events);
            return Ok(false);
        };

        let prompt = match meteor.size {
            MeteorSize::Small => {
                let smooth = ship
                    .component(target)
                    .is_some_and(|c| c.connector(meteor.from).is_empty());
                if smooth {
                    self.outcome(player, Outcome::Deflected, events);
                    return Ok(false);
                }
                (ship.shielded(meteor.from) && ship.batteries() > 0)
                    .then_some(PlayerState::WaitShield)
            }
            MeteorSize::Large => match ship.cannon_in_line(meteor.from, line) {
                Some((_, false)) => {
                    self.outcome(player, Outcome::Deflected, events);
                    return Ok(false);
                }
                Some((_, true)) if ship.batteries() > 0 => Some(PlayerState::WaitCannons),
                _ => None,
            },
        };

        match prompt {
            Some(state) => {
                self.phases.set(player, state, events);
                Ok(true)
            }
            None => self.hit(player, target, events),
        }
    }

    /// Destroy a hit component; true when the owner must now pick a ship part.
    fn hit(
        &mut self,
        player: &str,
        target: ComponentId,
        events: &mut EventCollector,
    ) -> Result<bool, EngineError> {
        self.ship_mut(player)?.destroy(target, events)?;
        self.outcome(player, Outcome::Hit { component: target }, events);
        self.split_ship(player, events)
    }

    /// Everyone has faced the card: next meteor, planet travel days, or done.
    fn conclude_card(&mut self, events: &mut EventCollector) -> Result<(), EngineError> {
        let leader = self.flight.leader();
        let order = self.flight.order();
        let Some(encounter) = self.encounter.as_mut() else {
            return self.begin_round(events);
        };

        let more_meteors = matches!(
            &encounter.card.kind,
            CardKind::MeteorSwarm { meteors } if encounter.meteor + 1 < meteors.len()
        );
        if let (true, Some(leader)) = (more_meteors, leader.as_deref()) {
            encounter.meteor += 1;
            encounter.line = None;
            self.phases.set(leader, PlayerState::WaitRollDices, events);
            return Ok(());
        }
        if let CardKind::Planets { days, .. } = encounter.card.kind {
            let days = i64::from(days);
            let landed: Vec<String> = order
                .into_iter()
                .rev()
                .filter(|p| encounter.landings.iter().flatten().any(|l| l == p))
                .collect();
            for player in landed {
                if days > 0 {
                    self.move_player(&player, -days, events)?;
                }
            }
        }
        self.finish_encounter(events)
    }

    fn finish_encounter(&mut self, events: &mut EventCollector) -> Result<(), EngineError> {
        if let Some(encounter) = self.encounter.take() {
            events.emit(Event::system(EventPayload::CardResolved {
                card: encounter.card.id,
            }));
        }
        for player in self.flight.order() {
            if self.ship(&player)?.crew() == 0 {
                self.retire(&player, RetireReason::NoCrew, events);
            }
        }
        for player in self.flight.lapped() {
            self.retire(&player, RetireReason::Lapped, events);
        }
        self.begin_round(events)
    }

    pub(crate) fn activate_engines(
        &mut self,
        player: &str,
        batteries: &[ComponentId],
        engines: &[ComponentId],
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        self.require_encounter(player, &[PlayerState::WaitEngines])?;
        if batteries.len() != engines.len() {
            return Err(EngineError::InvalidArgument("one battery per double engine"));
        }
        let ship = self.ship(player)?;
        let power = ship.engine_power(engines)?;
        ship.check_batteries(batteries)?;

        self.ship_mut(player)?.spend_batteries(batteries, events)?;
        self.phases.set(player, PlayerState::Wait, events);
        if power == 0 {
            self.retire(player, RetireReason::NoEnginePower, events);
        } else {
            let steps = i64::from(power);
            self.move_player(player, steps, events)?;
            self.outcome(player, Outcome::Moved { steps }, events);
        }
        self.next_turn(events)
    }

    pub(crate) fn activate_cannons(
        &mut self,
        player: &str,
        batteries: &[ComponentId],
        cannons: &[ComponentId],
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let (state, encounter) = self.require_encounter(player, &[PlayerState::WaitCannons])?;
        let kind = encounter.card.kind.clone();
        let aim = encounter.current_meteor().zip(encounter.line);
        if batteries.len() != cannons.len() {
            return Err(EngineError::InvalidArgument("one battery per double cannon"));
        }
        let ship = self.ship(player)?;
        let power = ship.cannon_power(cannons)?;
        ship.check_batteries(batteries)?;

        if let CardKind::MeteorSwarm { .. } = kind {
            let (meteor, line) = aim.ok_or(EngineError::IllegalPhase(state))?;
            let cells = line_cells(meteor.from, line);
            let defended = cannons.iter().any(|id| {
                ship.component(*id).is_some_and(|c| {
                    c.position.is_some_and(|p| cells.contains(&p))
                        && matches!(c.kind, ComponentKind::Cannon { direction, .. } if direction == meteor.from)
                })
            });
            let target = ship.first_in_line(meteor.from, line);

            self.ship_mut(player)?.spend_batteries(batteries, events)?;
            self.phases.set(player, PlayerState::Wait, events);
            if defended {
                self.outcome(player, Outcome::Deflected, events);
            } else if let Some(target) = target {
                if self.hit(player, target, events)? {
                    return Ok(());
                }
            }
            return self.next_turn(events);
        }

        let (firepower, lose) = match kind {
            CardKind::Smugglers {
                firepower,
                goods_penalty,
                ..
            } => (firepower, Penalty::Goods(goods_penalty)),
            CardKind::Slavers {
                firepower,
                crew_penalty,
                ..
            } => (firepower, Penalty::Crew(crew_penalty)),
            _ => return Err(EngineError::IllegalPhase(state)),
        };

        self.ship_mut(player)?.spend_batteries(batteries, events)?;
        self.phases.set(player, PlayerState::Wait, events);
        if power > firepower {
            self.outcome(player, Outcome::Won, events);
            self.phases.set(player, PlayerState::WaitBoolean, events);
            return Ok(());
        }
        if power < firepower {
            self.outcome(player, Outcome::Lost, events);
            let prompted = match lose {
                Penalty::Goods(count) => self.penalize_goods(player, count, events)?,
                Penalty::Crew(count) => self.penalize_crew(player, count, events)?,
            };
            if prompted {
                return Ok(());
            }
        } else {
            self.outcome(player, Outcome::Tied, events);
        }
        self.next_turn(events)
    }

    /// Goods are chosen by the player; without goods, batteries go instead.
    fn penalize_goods(
        &mut self,
        player: &str,
        count: u32,
        events: &mut EventCollector,
    ) -> Result<bool, EngineError> {
        if self.ship(player)?.goods().total() == 0 {
            self.ship_mut(player)?.forfeit(count, events);
            return Ok(false);
        }
        if let Some(encounter) = self.encounter.as_mut() {
            encounter.penalty = count;
        }
        self.phases.set(player, PlayerState::WaitRemoveGoods, events);
        Ok(true)
    }

    /// A crew no larger than the penalty is lost without asking.
    fn penalize_crew(
        &mut self,
        player: &str,
        count: u32,
        events: &mut EventCollector,
    ) -> Result<bool, EngineError> {
        let ship = self.ship(player)?;
        if ship.crew_members() <= count {
            let everyone = ship.all_crew();
            self.ship_mut(player)?.remove_crew(&everyone, events)?;
            return Ok(false);
        }
        if let Some(encounter) = self.encounter.as_mut() {
            encounter.penalty = count;
        }
        self.phases.set(player, PlayerState::WaitRemoveCrew, events);
        Ok(true)
    }

    pub(crate) fn activate_shield(
        &mut self,
        player: &str,
        battery: Option<ComponentId>,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let (state, encounter) = self.require_encounter(player, &[PlayerState::WaitShield])?;
        let (meteor, line) = encounter
            .current_meteor()
            .zip(encounter.line)
            .ok_or(EngineError::IllegalPhase(state))?;
        let ship = self.ship(player)?;
        let target = ship.first_in_line(meteor.from, line);

        match battery {
            Some(id) => {
                self.ship_mut(player)?.spend_batteries(&[id], events)?;
                self.phases.set(player, PlayerState::Wait, events);
                self.outcome(player, Outcome::Deflected, events);
            }
            None => {
                self.phases.set(player, PlayerState::Wait, events);
                if let Some(target) = target {
                    if self.hit(player, target, events)? {
                        return Ok(());
                    }
                }
            }
        }
        self.next_turn(events)
    }

    pub(crate) fn submit_boolean(
        &mut self,
        player: &str,
        value: bool,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let (state, encounter) = self.require_encounter(player, &[PlayerState::WaitBoolean])?;
        let kind = encounter.card.kind.clone();
        let enemy = matches!(kind, CardKind::Smugglers { .. } | CardKind::Slavers { .. });
        if !enemy
            && !matches!(
                kind,
                CardKind::AbandonedShip { .. } | CardKind::AbandonedStation { .. }
            )
        {
            return Err(EngineError::IllegalPhase(state));
        }

        self.phases.set(player, PlayerState::Wait, events);
        if !value {
            self.outcome(player, Outcome::Declined, events);
            // A beaten enemy is gone even when the reward is declined.
            if let Some(encounter) = self.encounter.as_mut() {
                encounter.closed |= enemy;
            }
            return self.next_turn(events);
        }

        self.outcome(player, Outcome::Accepted, events);
        let Some(encounter) = self.encounter.as_mut() else {
            return Err(EngineError::IllegalPhase(state));
        };
        encounter.closed = true;
        match kind {
            CardKind::AbandonedShip { crew, .. } => {
                encounter.penalty = crew;
                self.phases.set(player, PlayerState::WaitRemoveCrew, events);
                Ok(())
            }
            CardKind::AbandonedStation { goods, .. }
            | CardKind::Smugglers { reward: goods, .. } => {
                encounter.offered = goods;
                self.phases.set(player, PlayerState::WaitGoods, events);
                Ok(())
            }
            CardKind::Slavers { credits, days, .. } => {
                self.add_credits(player, credits, events);
                if days > 0 {
                    self.move_player(player, -i64::from(days), events)?;
                }
                self.next_turn(events)
            }
            _ => Err(EngineError::IllegalPhase(state)),
        }
    }

    pub(crate) fn update_goods(
        &mut self,
        player: &str,
        cargo: &[(ComponentId, Vec<GoodColor>)],
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let (state, encounter) = self.require_encounter(
            player,
            &[PlayerState::WaitGoods, PlayerState::WaitRemoveGoods],
        )?;
        let offered = encounter.offered.clone();
        let penalty = encounter.penalty;
        let kind = encounter.card.kind.clone();

        if state == PlayerState::WaitRemoveGoods {
            let ship = self.ship(player)?;
            let (gained, lost) = ship.plan_goods(cargo, &[])?;
            let owed = penalty.min(ship.goods().total());
            if gained.total() > 0 || lost != ship.most_valuable(owed) {
                return Err(EngineError::InvalidArgument(
                    "the most valuable goods must be given up",
                ));
            }
            let ship = self.ship_mut(player)?;
            ship.update_goods(cargo, &[], events)?;
            if penalty > owed {
                ship.forfeit(penalty - owed, events);
            }
            self.phases.set(player, PlayerState::Wait, events);
            return self.next_turn(events);
        }

        self.ship_mut(player)?.update_goods(cargo, &offered, events)?;
        self.phases.set(player, PlayerState::Wait, events);
        if let CardKind::AbandonedStation { days, .. } | CardKind::Smugglers { days, .. } = kind {
            if days > 0 {
                self.move_player(player, -i64::from(days), events)?;
            }
        }
        self.next_turn(events)
    }

    pub(crate) fn remove_crew(
        &mut self,
        player: &str,
        cabins: &[ComponentId],
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let (_, encounter) = self.require_encounter(player, &[PlayerState::WaitRemoveCrew])?;
        let penalty = encounter.penalty;
        let kind = encounter.card.kind.clone();
        if cabins.len() != penalty as usize {
            return Err(EngineError::InvalidArgument("wrong number of crew members"));
        }

        self.ship_mut(player)?.remove_crew(cabins, events)?;
        self.phases.set(player, PlayerState::Wait, events);
        if let CardKind::AbandonedShip { credits, days, .. } = kind {
            self.add_credits(player, credits, events);
            if days > 0 {
                self.move_player(player, -i64::from(days), events)?;
            }
        }
        self.next_turn(events)
    }

    pub(crate) fn roll_dices(
        &mut self,
        player: &str,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let (state, encounter) = self.require_encounter(player, &[PlayerState::WaitRollDices])?;
        let meteor = encounter
            .current_meteor()
            .ok_or(EngineError::IllegalPhase(state))?;

        let dice = [self.rng.gen_range(1..=6u8), self.rng.gen_range(1..=6u8)];
        let line = meteor_line(meteor.from, dice[0] + dice[1]);
        events.emit(Event::all(
            player,
            EventPayload::DiceRolled {
                player: player.to_string(),
                dice,
            },
        ));
        events.emit(Event::all(
            player,
            EventPayload::MeteorIncoming {
                size: meteor.size,
                from: meteor.from,
                line,
            },
        ));

        let order = self.flight.order();
        if let Some(encounter) = self.encounter.as_mut() {
            encounter.line = line;
            encounter.queue = order.into();
        }
        self.phases.set(player, PlayerState::Wait, events);
        self.next_turn(events)
    }

    pub(crate) fn submit_index(
        &mut self,
        player: &str,
        index: Option<usize>,
        events: &mut EventCollector,
    ) -> Result<(), EngineError> {
        let (state, encounter) = self.require_encounter(player, &[PlayerState::WaitIndex])?;
        let CardKind::Planets { planets, .. } = &encounter.card.kind else {
            return Err(EngineError::IllegalPhase(state));
        };

        let Some(index) = index else {
            self.phases.set(player, PlayerState::Wait, events);
            self.outcome(player, Outcome::Declined, events);
            return self.next_turn(events);
        };
        let goods = planets
            .get(index)
            .cloned()
            .ok_or(EngineError::InvalidArgument("no such planet"))?;
        if encounter.landings.get(index).is_some_and(Option::is_some) {
            return Err(EngineError::InvalidArgument("planet already taken"));
        }

        if let Some(encounter) = self.encounter.as_mut() {
            if let Some(slot) = encounter.landings.get_mut(index) {
                *slot = Some(player.to_string());
            }
            encounter.offered = goods;
        }
        self.outcome(player, Outcome::Landed { planet: index }, events);
        self.phases.set(player, PlayerState::WaitGoods, events);
        Ok(())
    }
}
