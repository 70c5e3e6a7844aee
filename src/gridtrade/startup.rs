use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::{Duration, Instant};

use super::ladder::{GridLadder, HeldLeg, LevelState};
use super::types::{LegSlot, PositionHandle};
use super::{notional_of, GridEngine};
use crate::config::StartupEstimate;

/// Where the pre-existing exposure figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureSource {
    ManualOverride,
    OpenPositions,
    NetExposure,
    None,
}

impl ExposureSource {
    fn placeholder(self) -> PositionHandle {
        match self {
            ExposureSource::ManualOverride => PositionHandle::ManualOverride,
            _ => PositionHandle::Detected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedExposure {
    pub source: ExposureSource,
    pub notional_a: f64,
    pub notional_b: f64,
}

impl DetectedExposure {
    pub fn total(&self) -> f64 {
        self.notional_a + self.notional_b
    }
}

#[derive(Debug, Clone)]
pub struct StartupSynchronizer {
    settle_delay: Duration,
    manual_override: f64,
    estimate: StartupEstimate,
    synced: bool,
}

impl StartupSynchronizer {
    pub fn new(settle_delay: Duration, manual_override: f64, estimate: StartupEstimate) -> Self {
        Self {
            settle_delay,
            manual_override,
            estimate,
            synced: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn ready(&self, started_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(started_at) >= self.settle_delay
    }
}

/// Number of ladder levels, counted from the lowest, that `detected` notional accounts for.
pub fn estimate_levels_filled(ladder: &GridLadder, detected: f64, mode: StartupEstimate) -> usize {
    if detected <= 0.0 || ladder.is_empty() {
        return 0;
    }
    match mode {
        StartupEstimate::Unweighted => {
            let per_grid = 2.0 * ladder.base_notional();
            if per_grid <= 0.0 {
                return 0;
            }
            ((detected / per_grid).floor() as usize).min(ladder.len())
        }
        StartupEstimate::Weighted => {
            let mut sum = 0.0;
            let mut count = 0;
            for index in 0..ladder.len() {
                sum += 2.0 * ladder.level_notional(index);
                if sum > detected {
                    break;
                }
                count += 1;
            }
            count
        }
    }
}

impl GridEngine {
    /// External truth about pre-existing exposure, in priority order: manual override,
    /// open positions, net exposure, nothing.
    fn detect_exposure(&self) -> DetectedExposure {
        if self.startup.manual_override > 0.0 {
            return DetectedExposure {
                source: ExposureSource::ManualOverride,
                notional_a: self.startup.manual_override,
                notional_b: 0.0,
            };
        }

        let mut notionals = [0.0_f64; 2];
        match self.positions.open_positions() {
            Ok(positions) => {
                let mut found = false;
                for slot in LegSlot::BOTH {
                    let instrument = self.quotes.instrument(slot);
                    for pos in positions
                        .iter()
                        .filter(|p| &p.instrument == instrument && p.quantity != Decimal::ZERO)
                    {
                        let price = pos.avg_price.to_f64().unwrap_or(0.0);
                        let notional = notional_of(pos.quantity, price);
                        log::info!(
                            "[STARTUP] found {} position qty={} side={} notional={:.2}",
                            instrument,
                            pos.quantity,
                            if pos.is_long { "LONG" } else { "SHORT" },
                            notional
                        );
                        notionals[slot.index()] += notional;
                        found = true;
                    }
                }
                if found {
                    return DetectedExposure {
                        source: ExposureSource::OpenPositions,
                        notional_a: notionals[0],
                        notional_b: notionals[1],
                    };
                }
            }
            Err(e) => log::warn!("[STARTUP] open position query failed: {}", e),
        }

        for slot in LegSlot::BOTH {
            let instrument = self.quotes.instrument(slot);
            match self.positions.net_exposure(instrument) {
                Ok(Some(exposure)) if exposure != 0.0 => {
                    log::info!("[STARTUP] {} net exposure {:.2}", instrument, exposure);
                    notionals[slot.index()] = exposure.abs();
                }
                Ok(_) => {}
                Err(e) => log::warn!("[STARTUP] net exposure query failed for {}: {}", instrument, e),
            }
        }
        let source = if notionals.iter().any(|n| *n > 0.0) {
            ExposureSource::NetExposure
        } else {
            ExposureSource::None
        };
        DetectedExposure {
            source,
            notional_a: notionals[0],
            notional_b: notionals[1],
        }
    }

    /// Seeds the ladder and the ledger from pre-existing exposure. Runs once, before the
    /// first decision cycle.
    pub(super) fn run_startup_sync(&mut self, now: Instant) {
        let detected = self.detect_exposure();
        let total = detected.total();

        if detected.source == ExposureSource::None {
            log::info!("[STARTUP] no existing positions detected, starting fresh");
        } else {
            let filled = estimate_levels_filled(&self.ladder, total, self.startup.estimate);
            let handle = detected.source.placeholder();
            for index in 0..filled {
                let level = self.ladder.level_mut(index);
                level.state = LevelState::Open;
                level.legs = [
                    Some(HeldLeg::placeholder(handle.clone())),
                    Some(HeldLeg::placeholder(handle.clone())),
                ];
                log::info!(
                    "[STARTUP] marked level={:.4}% as occupied ({:?})",
                    self.ladder.threshold(index) * 100.0,
                    detected.source
                );
            }
            log::warn!(
                "⚠️ [STARTUP] detected {} grid(s) of existing exposure from {:?}: total={:.2} (A={:.2}, B={:.2})",
                filled,
                detected.source,
                total,
                detected.notional_a,
                detected.notional_b
            );
        }

        self.ledger.overwrite_confirmed(total);
        self.startup.synced = true;
        self.reconciler.mark(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LevelWeight;

    fn ladder(weights: &[LevelWeight]) -> GridLadder {
        GridLadder::new(&[0.001, 0.002, 0.003, 0.004], weights, 100.0)
    }

    #[test]
    fn unweighted_estimate_floors_per_grid() {
        let ladder = ladder(&[]);
        assert_eq!(estimate_levels_filled(&ladder, 250.0, StartupEstimate::Unweighted), 1);
        assert_eq!(estimate_levels_filled(&ladder, 400.0, StartupEstimate::Unweighted), 2);
        assert_eq!(estimate_levels_filled(&ladder, 199.0, StartupEstimate::Unweighted), 0);
        assert_eq!(estimate_levels_filled(&ladder, 0.0, StartupEstimate::Unweighted), 0);
    }

    #[test]
    fn estimate_is_capped_at_ladder_length() {
        let ladder = ladder(&[]);
        assert_eq!(estimate_levels_filled(&ladder, 10_000.0, StartupEstimate::Unweighted), 4);
        assert_eq!(estimate_levels_filled(&ladder, 10_000.0, StartupEstimate::Weighted), 4);
    }

    #[test]
    fn weighted_estimate_accounts_for_multipliers() {
        let weights = vec![
            LevelWeight {
                level: 0.001,
                weight: 2.0,
            },
            LevelWeight {
                level: 0.002,
                weight: 2.0,
            },
        ];
        let ladder = ladder(&weights);
        // Levels cost 400, 400, 200, 200 for both legs.
        assert_eq!(estimate_levels_filled(&ladder, 800.0, StartupEstimate::Unweighted), 4);
        assert_eq!(estimate_levels_filled(&ladder, 800.0, StartupEstimate::Weighted), 2);
        assert_eq!(estimate_levels_filled(&ladder, 399.0, StartupEstimate::Weighted), 0);
    }

    #[test]
    fn ready_after_settle_delay() {
        let sync = StartupSynchronizer::new(Duration::from_secs(10), 0.0, StartupEstimate::Unweighted);
        let t0 = Instant::now();
        assert!(!sync.ready(t0, t0 + Duration::from_secs(9)));
        assert!(sync.ready(t0, t0 + Duration::from_secs(10)));
        assert!(!sync.is_synced());
    }
}
