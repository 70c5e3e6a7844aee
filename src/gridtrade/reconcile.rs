use rust_decimal::prelude::ToPrimitive;
use std::time::{Duration, Instant};

use super::error::GridError;
use super::types::LegSlot;
use super::{notional_of, GridEngine};

/// Periodic correction of tracked exposure against what the venue reports.
#[derive(Debug, Clone)]
pub struct ReconciliationLoop {
    interval: Duration,
    drift_threshold: f64,
    imbalance_ratio: f64,
    last_run: Option<Instant>,
}

/// Outcome of comparing tracked and actual notional.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub actual_total: f64,
    pub drift: Option<GridError>,
    pub imbalance: Option<GridError>,
}

impl ReconciliationLoop {
    pub fn new(interval: Duration, drift_threshold: f64, imbalance_ratio: f64) -> Self {
        Self {
            interval,
            drift_threshold,
            imbalance_ratio,
            last_run: None,
        }
    }

    /// Never due before startup sync has started the clock.
    pub fn due(&self, now: Instant) -> bool {
        self.last_run
            .map(|last| now.saturating_duration_since(last) >= self.interval)
            .unwrap_or(false)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_run = Some(now);
    }

    /// The drift and imbalance checks are independent: a badly skewed book is flagged
    /// even when the total matches what the ledger tracks.
    pub fn evaluate(&self, tracked: f64, notional_a: f64, notional_b: f64) -> ReconcileOutcome {
        let actual_total = notional_a + notional_b;
        let drift = ((actual_total - tracked).abs() > self.drift_threshold).then_some(
            GridError::ReconciliationDrift {
                tracked,
                actual: actual_total,
            },
        );
        let imbalance = if actual_total > 0.0 {
            let ratio = (notional_a - notional_b).abs() / actual_total;
            (ratio > self.imbalance_ratio).then_some(GridError::CriticalImbalance {
                ratio,
                notional_a,
                notional_b,
            })
        } else {
            None
        };
        ReconcileOutcome {
            actual_total,
            drift,
            imbalance,
        }
    }
}

impl GridEngine {
    pub(super) fn reconcile(&mut self, now: Instant) {
        self.reconciler.mark(now);
        let positions = match self.positions.open_positions() {
            Ok(positions) => positions,
            Err(e) => {
                log::warn!("[RECONCILE] position query failed, skipping: {}", e);
                return;
            }
        };

        let mut notionals = [0.0_f64; 2];
        for slot in LegSlot::BOTH {
            let instrument = self.quotes.instrument(slot);
            let mid = self.quotes.mid(slot);
            notionals[slot.index()] = positions
                .iter()
                .filter(|p| &p.instrument == instrument)
                .map(|p| {
                    let price = mid.unwrap_or_else(|| p.avg_price.to_f64().unwrap_or(0.0));
                    notional_of(p.quantity, price)
                })
                .sum();
        }

        let tracked = self.ledger.confirmed();
        let outcome = self
            .reconciler
            .evaluate(tracked, notionals[0], notionals[1]);
        log::info!(
            "[RECONCILE] tracked={:.2} actual={:.2} (A={:.2}, B={:.2}) diff={:.2}",
            tracked,
            outcome.actual_total,
            notionals[0],
            notionals[1],
            (outcome.actual_total - tracked).abs()
        );

        if let Some(drift) = outcome.drift {
            self.ledger.overwrite_confirmed(outcome.actual_total);
            self.raise(drift);
        }
        if let Some(imbalance) = outcome.imbalance {
            self.raise(imbalance);
        }

        match serde_json::to_string(&self.snapshot()) {
            Ok(json) => log::info!("[RECONCILE] snapshot {}", json),
            Err(e) => log::warn!("[RECONCILE] failed to serialize snapshot: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> ReconciliationLoop {
        ReconciliationLoop::new(Duration::from_secs(60), 100.0, 0.20)
    }

    #[test]
    fn not_due_until_marked() {
        let mut r = reconciler();
        let t0 = Instant::now();
        assert!(!r.due(t0 + Duration::from_secs(3600)));
        r.mark(t0);
        assert!(!r.due(t0 + Duration::from_secs(59)));
        assert!(r.due(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn drift_over_threshold_is_reported() {
        let outcome = reconciler().evaluate(1000.0, 350.0, 350.0);
        assert_eq!(outcome.actual_total, 700.0);
        assert_eq!(
            outcome.drift,
            Some(GridError::ReconciliationDrift {
                tracked: 1000.0,
                actual: 700.0
            })
        );
        assert!(outcome.imbalance.is_none());
    }

    #[test]
    fn small_drift_is_tolerated() {
        let outcome = reconciler().evaluate(700.0, 380.0, 370.0);
        assert!(outcome.drift.is_none());
        assert!(outcome.imbalance.is_none());
    }

    #[test]
    fn imbalance_is_flagged_without_drift() {
        let outcome = reconciler().evaluate(400.0, 300.0, 100.0);
        assert!(outcome.drift.is_none());
        match outcome.imbalance {
            Some(GridError::CriticalImbalance { ratio, .. }) => assert!((ratio - 0.5).abs() < 1e-12),
            other => panic!("expected imbalance, got {:?}", other),
        }
    }

    #[test]
    fn flat_book_has_no_imbalance() {
        let outcome = reconciler().evaluate(0.0, 0.0, 0.0);
        assert!(outcome.drift.is_none());
        assert!(outcome.imbalance.is_none());
    }
}
