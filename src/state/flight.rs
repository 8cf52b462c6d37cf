//! Flight circuit and the building hourglass.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Seconds the hourglass runs after each flip.
pub const DEFAULT_HOURGLASS_SECS: i64 = 60;

/// Hourglass notches, the last one ending the build.
pub const DEFAULT_HOURGLASS_NOTCHES: u8 = 3;

/// Longest accepted hourglass run.
pub const MAX_HOURGLASS_SECS: i64 = 3600;

/// Positions of the ships on the circular flight board.
///
/// Positions are absolute progress, not cells: a player one full circuit
/// behind the leader has been lapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightBoard {
    circuit: i64,
    positions: BTreeMap<String, i64>,
    retired: Vec<String>,
}

impl FlightBoard {
    pub fn new(circuit: i64) -> Self {
        Self {
            circuit,
            positions: BTreeMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn circuit(&self) -> i64 {
        self.circuit
    }

    /// Put a ship on its starting cell.
    pub fn place(&mut self, player: &str, position: i64) {
        self.positions.insert(player.to_string(), position);
    }

    pub fn position(&self, player: &str) -> Result<i64, EngineError> {
        self.positions
            .get(player)
            .copied()
            .ok_or_else(|| EngineError::player(player))
    }

    pub fn positions(&self) -> &BTreeMap<String, i64> {
        &self.positions
    }

    pub fn retired(&self) -> &[String] {
        &self.retired
    }

    pub fn is_flying(&self, player: &str) -> bool {
        self.positions.contains_key(player) && !self.is_retired(player)
    }

    pub fn is_retired(&self, player: &str) -> bool {
        self.retired.iter().any(|p| p == player)
    }

    /// Flying players, leader first.
    pub fn order(&self) -> Vec<String> {
        let mut flying: Vec<(&String, i64)> = self
            .positions
            .iter()
            .filter(|(p, _)| !self.is_retired(p))
            .map(|(p, pos)| (p, *pos))
            .collect();
        flying.sort_by(|a, b| b.1.cmp(&a.1));
        flying.into_iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn leader(&self) -> Option<String> {
        self.order().into_iter().next()
    }

    fn occupied(&self, position: i64, except: &str) -> bool {
        let cell = position.rem_euclid(self.circuit);
        self.positions
            .iter()
            .filter(|(p, _)| p.as_str() != except && !self.is_retired(p))
            .any(|(_, pos)| pos.rem_euclid(self.circuit) == cell)
    }

    /// Move by `steps` free cells, forward when positive; occupied cells do
    /// not count.
    pub fn advance(&mut self, player: &str, steps: i64) -> Result<i64, EngineError> {
        let mut position = self.position(player)?;
        let step = steps.signum();
        let mut left = steps.abs();
        while left > 0 {
            position += step;
            if !self.occupied(position, player) {
                left -= 1;
            }
        }
        self.positions.insert(player.to_string(), position);
        Ok(position)
    }

    /// Flying players a full circuit behind the leader.
    pub fn lapped(&self) -> Vec<String> {
        let order = self.order();
        let Some(lead) = order.first().and_then(|p| self.positions.get(p)) else {
            return Vec::new();
        };
        order
            .iter()
            .filter(|p| {
                self.positions
                    .get(*p)
                    .is_some_and(|pos| lead - pos >= self.circuit)
            })
            .cloned()
            .collect()
    }

    pub fn retire(&mut self, player: &str) {
        if !self.is_retired(player) {
            self.retired.push(player.to_string());
        }
    }

    /// Rebuild from stored positions.
    pub fn restore(circuit: i64, positions: BTreeMap<String, i64>, retired: Vec<String>) -> Self {
        Self {
            circuit,
            positions,
            retired,
        }
    }
}

/// Shared building timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hourglass {
    /// Current notch, starting at zero
    pub position: u8,
    pub last: u8,
    pub duration_secs: i64,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

impl Hourglass {
    /// Start running on the first notch.
    pub fn start(now: DateTime<Utc>, notches: u8, duration_secs: i64) -> Self {
        Self {
            position: 0,
            last: notches.saturating_sub(1),
            duration_secs,
            expires_at: now + Duration::seconds(duration_secs),
            expired: false,
        }
    }

    pub fn is_last(&self) -> bool {
        self.position >= self.last
    }

    /// Whether the next flip lands on the last notch.
    pub fn flips_to_last(&self) -> bool {
        self.position + 1 >= self.last
    }

    pub fn can_flip(&self) -> bool {
        self.expired && !self.is_last()
    }

    pub fn flip(&mut self, now: DateTime<Utc>) {
        self.position += 1;
        self.expires_at = now + Duration::seconds(self.duration_secs);
        self.expired = false;
    }

    /// Mark the sand as run out; true only on the tick that expires it.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if self.expired || now < self.expires_at {
            return false;
        }
        self.expired = true;
        true
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}
