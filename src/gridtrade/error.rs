use std::error::Error;
use std::fmt;

use super::types::{InstrumentId, LegSlot, OrderHandle};

/// Incidents raised by the engine. Apart from `InstrumentNotFound`, every variant is
/// recovered inside the engine and reported back from `GridEngine::handle_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum GridError {
    OrderRejected {
        level: f64,
        order: OrderHandle,
        reason: String,
    },
    OrderTimeout {
        level: f64,
        closing: bool,
    },
    PartialFillImbalance {
        level: f64,
        filled: LegSlot,
    },
    ReconciliationDrift {
        tracked: f64,
        actual: f64,
    },
    CriticalImbalance {
        ratio: f64,
        notional_a: f64,
        notional_b: f64,
    },
    ExtremeSpread {
        spread: f64,
        limit: f64,
    },
    InstrumentNotFound(InstrumentId),
    CloseSubmissionFailure {
        level: f64,
        slot: LegSlot,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl GridError {
    pub fn severity(&self) -> Severity {
        match self {
            GridError::OrderRejected { .. }
            | GridError::OrderTimeout { .. }
            | GridError::PartialFillImbalance { .. }
            | GridError::ReconciliationDrift { .. }
            | GridError::ExtremeSpread { .. } => Severity::Warning,
            GridError::CloseSubmissionFailure { .. } => Severity::Error,
            GridError::CriticalImbalance { .. } | GridError::InstrumentNotFound(_) => {
                Severity::Critical
            }
        }
    }

    /// Key used to throttle alert delivery for repeated incidents.
    pub fn alert_key(&self) -> &'static str {
        match self {
            GridError::OrderRejected { .. } => "order_rejected",
            GridError::OrderTimeout { .. } => "order_timeout",
            GridError::PartialFillImbalance { .. } => "partial_fill_imbalance",
            GridError::ReconciliationDrift { .. } => "reconciliation_drift",
            GridError::CriticalImbalance { .. } => "critical_imbalance",
            GridError::ExtremeSpread { .. } => "extreme_spread",
            GridError::InstrumentNotFound(_) => "instrument_not_found",
            GridError::CloseSubmissionFailure { .. } => "close_submission_failure",
        }
    }
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GridError::OrderRejected {
                level,
                order,
                reason,
            } => write!(
                f,
                "order {} rejected at level={:.4}%: {}",
                order,
                level * 100.0,
                reason
            ),
            GridError::OrderTimeout { level, closing } => write!(
                f,
                "{} orders timed out at level={:.4}%",
                if *closing { "close" } else { "open" },
                level * 100.0
            ),
            GridError::PartialFillImbalance { level, filled } => write!(
                f,
                "imbalanced fill at level={:.4}%: only leg {:?} filled",
                level * 100.0,
                filled
            ),
            GridError::ReconciliationDrift { tracked, actual } => write!(
                f,
                "position drift: tracked={:.2} actual={:.2} diff={:.2}",
                tracked,
                actual,
                (actual - tracked).abs()
            ),
            GridError::CriticalImbalance {
                ratio,
                notional_a,
                notional_b,
            } => write!(
                f,
                "critical leg imbalance {:.2}% (A={:.2}, B={:.2})",
                ratio * 100.0,
                notional_a,
                notional_b
            ),
            GridError::ExtremeSpread { spread, limit } => write!(
                f,
                "extreme spread {:.4}% beyond stop {:.4}%",
                spread * 100.0,
                limit * 100.0
            ),
            GridError::InstrumentNotFound(id) => write!(f, "instrument not found: {}", id),
            GridError::CloseSubmissionFailure {
                level,
                slot,
                detail,
            } => write!(
                f,
                "no close order produced for leg {:?} at level={:.4}%: {}",
                slot,
                level * 100.0,
                detail
            ),
        }
    }
}

impl Error for GridError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_incidents_are_warnings() {
        let err = GridError::OrderTimeout {
            level: 0.001,
            closing: false,
        };
        assert_eq!(err.severity(), Severity::Warning);
        assert_eq!(err.to_string(), "open orders timed out at level=0.1000%");
    }

    #[test]
    fn imbalance_is_critical() {
        let err = GridError::CriticalImbalance {
            ratio: 0.5,
            notional_a: 300.0,
            notional_b: 100.0,
        };
        assert_eq!(err.severity(), Severity::Critical);
    }
}
