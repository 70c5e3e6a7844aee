use std::time::Instant;

use super::error::GridError;
use super::ladder::LevelState;
use super::GridEngine;

/// Trips when the spread magnitude leaves the range the grid was built for.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    limit: f64,
}

impl KillSwitch {
    pub fn new(limit: f64) -> Self {
        Self { limit }
    }

    pub fn check(&self, spread: f64) -> Option<GridError> {
        (spread.abs() > self.limit).then(|| GridError::ExtremeSpread {
            spread,
            limit: self.limit,
        })
    }
}

impl GridEngine {
    /// Closes every open level and abandons every in-flight open in the current cycle.
    pub(super) fn close_all(&mut self, now: Instant) {
        for index in 0..self.ladder.len() {
            let state = self.ladder.level(index).state;
            match state {
                LevelState::Open => {
                    self.start_close(index, now);
                }
                LevelState::OpenPending => self.abort_open_for_level(index),
                LevelState::ClosePending | LevelState::Empty => {}
            }
        }
        log::warn!(
            "[KILL] close-all issued (confirmed={:.2}, pending={:.2}, closing={})",
            self.ledger.confirmed(),
            self.ledger.pending(),
            self.close_txs.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_on_magnitude_either_side() {
        let switch = KillSwitch::new(0.015);
        assert!(switch.check(0.0149).is_none());
        assert!(switch.check(0.015).is_none());
        assert_eq!(
            switch.check(-0.02),
            Some(GridError::ExtremeSpread {
                spread: -0.02,
                limit: 0.015
            })
        );
    }
}
