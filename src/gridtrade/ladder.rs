use rust_decimal::Decimal;
use serde::Serialize;

use super::types::{LegSlot, PositionHandle, Side};
use crate::config::LevelWeight;

const WEIGHT_MATCH_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelState {
    Empty,
    OpenPending,
    Open,
    ClosePending,
}

/// One leg of an established hedge. Side and quantity are unknown for legs inferred at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeldLeg {
    pub handle: PositionHandle,
    pub side: Option<Side>,
    pub quantity: Option<Decimal>,
}

impl HeldLeg {
    pub fn placeholder(handle: PositionHandle) -> Self {
        Self {
            handle,
            side: None,
            quantity: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GridLevel {
    pub threshold: f64,
    pub weight: f64,
    pub state: LevelState,
    pub legs: [Option<HeldLeg>; 2],
}

impl GridLevel {
    fn new(threshold: f64, weight: f64) -> Self {
        Self {
            threshold,
            weight,
            state: LevelState::Empty,
            legs: [None, None],
        }
    }

    /// Holds at least one leg, whether or not a close is already under way.
    pub fn is_occupied(&self) -> bool {
        self.legs.iter().any(Option::is_some)
    }

    pub fn leg(&self, slot: LegSlot) -> Option<&HeldLeg> {
        self.legs[slot.index()].as_ref()
    }

    pub fn clear(&mut self) {
        self.state = LevelState::Empty;
        self.legs = [None, None];
    }
}

/// Ascending ladder of spread thresholds and their occupancy.
#[derive(Debug, Clone)]
pub struct GridLadder {
    levels: Vec<GridLevel>,
    base_notional: f64,
}

impl GridLadder {
    /// `thresholds` must already be sorted ascending and deduplicated.
    pub fn new(thresholds: &[f64], weights: &[LevelWeight], base_notional: f64) -> Self {
        let levels = thresholds
            .iter()
            .map(|&threshold| {
                let weight = weights
                    .iter()
                    .find(|w| (w.level - threshold).abs() < WEIGHT_MATCH_EPSILON)
                    .map(|w| w.weight)
                    .unwrap_or(1.0);
                GridLevel::new(threshold, weight)
            })
            .collect();
        Self {
            levels,
            base_notional,
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> &GridLevel {
        &self.levels[index]
    }

    pub fn level_mut(&mut self, index: usize) -> &mut GridLevel {
        &mut self.levels[index]
    }

    pub fn threshold(&self, index: usize) -> f64 {
        self.levels[index].threshold
    }

    /// Per-leg notional of a level.
    pub fn level_notional(&self, index: usize) -> f64 {
        self.base_notional * self.levels[index].weight
    }

    pub fn base_notional(&self) -> f64 {
        self.base_notional
    }

    /// Fully open levels whose spread has fallen back under the preceding threshold.
    /// The first level's preceding threshold is zero.
    pub fn close_candidates(&self, abs_spread: f64) -> Vec<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(i, level)| {
                let prev = if *i == 0 {
                    0.0
                } else {
                    self.levels[i - 1].threshold
                };
                level.state == LevelState::Open && abs_spread < prev
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Idle levels whose threshold the spread has crossed, ascending. The caller still
    /// has to check each against the risk cap, in order.
    pub fn open_candidates(&self, abs_spread: f64) -> Vec<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, level)| {
                level.state == LevelState::Empty && !level.is_occupied() && abs_spread > level.threshold
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Sells the rich instrument and buys the cheap one: `(side of A, side of B)`.
pub fn leg_sides(spread: f64) -> (Side, Side) {
    if spread > 0.0 {
        (Side::Sell, Side::Buy)
    } else {
        (Side::Buy, Side::Sell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gridtrade::types::OrderHandle;

    fn ladder(levels: &[f64]) -> GridLadder {
        GridLadder::new(levels, &[], 100.0)
    }

    fn occupy(ladder: &mut GridLadder, index: usize) {
        let level = ladder.level_mut(index);
        level.state = LevelState::Open;
        level.legs = [
            Some(HeldLeg::placeholder(PositionHandle::Order(OrderHandle("a".into())))),
            Some(HeldLeg::placeholder(PositionHandle::Order(OrderHandle("b".into())))),
        ];
    }

    #[test]
    fn opens_every_crossed_idle_level() {
        let ladder = ladder(&[0.001, 0.002, 0.003]);
        assert_eq!(ladder.open_candidates(0.0025), vec![0, 1]);
        assert!(ladder.open_candidates(0.001).is_empty());
    }

    #[test]
    fn closes_when_spread_falls_under_previous_level() {
        let mut ladder = ladder(&[0.001, 0.002]);
        occupy(&mut ladder, 1);
        assert_eq!(ladder.close_candidates(0.0008), vec![1]);
        assert!(ladder.close_candidates(0.0012).is_empty());
    }

    #[test]
    fn first_level_never_closes_on_its_own() {
        let mut ladder = ladder(&[0.001, 0.002]);
        occupy(&mut ladder, 0);
        assert!(ladder.close_candidates(0.0).is_empty());
    }

    #[test]
    fn weights_scale_level_notional() {
        let weights = vec![LevelWeight {
            level: 0.002,
            weight: 1.5,
        }];
        let ladder = GridLadder::new(&[0.001, 0.002], &weights, 100.0);
        assert_eq!(ladder.level_notional(0), 100.0);
        assert_eq!(ladder.level_notional(1), 150.0);
    }

    #[test]
    fn occupied_levels_are_not_reopened() {
        let mut ladder = ladder(&[0.001, 0.002]);
        occupy(&mut ladder, 0);
        ladder.level_mut(1).state = LevelState::OpenPending;
        assert!(ladder.open_candidates(0.01).is_empty());
    }

    #[test]
    fn sides_short_the_rich_leg() {
        assert_eq!(leg_sides(0.002), (Side::Sell, Side::Buy));
        assert_eq!(leg_sides(-0.002), (Side::Buy, Side::Sell));
    }
}
