use serde::Serialize;

/// Confirmed vs in-flight notional. Both counters are floored at zero so overlapping
/// recovery paths cannot drive them negative.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskLedger {
    cap: f64,
    confirmed: f64,
    pending: f64,
}

impl RiskLedger {
    pub fn new(cap: f64) -> Self {
        Self {
            cap,
            confirmed: 0.0,
            pending: 0.0,
        }
    }

    pub fn confirmed(&self) -> f64 {
        self.confirmed
    }

    pub fn pending(&self) -> f64 {
        self.pending
    }

    pub fn cap(&self) -> f64 {
        self.cap
    }

    pub fn exposure(&self) -> f64 {
        self.confirmed + self.pending
    }

    pub fn can_open(&self, additional: f64) -> bool {
        self.confirmed + self.pending + additional <= self.cap
    }

    /// An open transaction went in flight.
    pub fn reserve(&mut self, amount: f64) {
        self.pending += amount.max(0.0);
    }

    /// Both legs of an open transaction filled.
    pub fn confirm(&mut self, amount: f64) {
        self.pending = (self.pending - amount).max(0.0);
        self.confirmed += amount.max(0.0);
    }

    /// An open transaction was abandoned.
    pub fn release(&mut self, amount: f64) {
        self.pending = (self.pending - amount).max(0.0);
    }

    /// Both legs of a close transaction filled.
    pub fn retire(&mut self, amount: f64) {
        self.confirmed = (self.confirmed - amount).max(0.0);
    }

    /// Startup sync and reconciliation replace the confirmed figure with external truth.
    pub fn overwrite_confirmed(&mut self, value: f64) {
        self.confirmed = value.max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_counts_confirmed_and_pending() {
        let mut ledger = RiskLedger::new(1000.0);
        ledger.overwrite_confirmed(400.0);
        ledger.reserve(400.0);
        assert!(ledger.can_open(200.0));
        assert!(!ledger.can_open(200.01));
    }

    #[test]
    fn confirm_moves_pending_to_confirmed() {
        let mut ledger = RiskLedger::new(1000.0);
        ledger.reserve(200.0);
        ledger.confirm(200.0);
        assert_eq!(ledger.pending(), 0.0);
        assert_eq!(ledger.confirmed(), 200.0);
        assert_eq!(ledger.exposure(), 200.0);
    }

    #[test]
    fn double_deduction_is_floored() {
        let mut ledger = RiskLedger::new(1000.0);
        ledger.reserve(200.0);
        ledger.release(200.0);
        ledger.release(200.0);
        ledger.retire(50.0);
        assert_eq!(ledger.pending(), 0.0);
        assert_eq!(ledger.confirmed(), 0.0);
    }
}
