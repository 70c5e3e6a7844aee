//! In-flight opens of a grid level: two aggressive legs that must both fill, or be
//! unwound, before the level may change state again.

use rust_decimal::Decimal;
use std::time::Instant;

use super::error::GridError;
use super::ladder::{leg_sides, HeldLeg, LevelState};
use super::types::{LegSlot, OrderHandle, OrderRequest, PositionHandle, Side};
use super::{GridEngine, OrderPurpose, TransactionId};

#[derive(Debug, Clone)]
pub struct OpenLeg {
    pub order: OrderHandle,
    pub side: Side,
    pub quantity: Decimal,
    pub filled: bool,
    pub filled_qty: Decimal,
}

impl OpenLeg {
    fn new(order: OrderHandle, side: Side, quantity: Decimal) -> Self {
        Self {
            order,
            side,
            quantity,
            filled: false,
            filled_qty: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenTransaction {
    pub id: TransactionId,
    pub level: usize,
    pub legs: [OpenLeg; 2],
    /// Both legs together, as reserved in the ledger.
    pub notional: f64,
    pub submitted_at: Instant,
}

impl OpenTransaction {
    pub fn leg(&self, slot: LegSlot) -> &OpenLeg {
        &self.legs[slot.index()]
    }

    pub fn slot_of(&self, order: &OrderHandle) -> Option<LegSlot> {
        LegSlot::BOTH
            .into_iter()
            .find(|slot| &self.legs[slot.index()].order == order)
    }

    pub fn filled_legs(&self) -> usize {
        self.legs.iter().filter(|leg| leg.filled).count()
    }

    pub fn order_handles(&self) -> impl Iterator<Item = &OrderHandle> {
        self.legs.iter().map(|leg| &leg.order)
    }
}

impl GridEngine {
    /// Sends both legs for `level` and reserves their notional. Returns false when
    /// nothing went in flight.
    pub(super) fn start_open(&mut self, level: usize, spread: f64, now: Instant) -> bool {
        let per_leg = self.ladder.level_notional(level);
        let (Some(qty_a), Some(qty_b)) = (
            self.leg_quantity(LegSlot::A, per_leg),
            self.leg_quantity(LegSlot::B, per_leg),
        ) else {
            log::warn!(
                "[OPEN] level={:.4}% notional={:.2} rounds to zero quantity, skipping",
                self.ladder.threshold(level) * 100.0,
                per_leg
            );
            return false;
        };
        let (side_a, side_b) = leg_sides(spread);

        let request_a = OrderRequest::open(self.quotes.instrument(LegSlot::A).clone(), side_a, qty_a);
        let Ok(order_a) = self.submit(level, LegSlot::A, OrderPurpose::OpenLeg, request_a) else {
            return false;
        };
        let request_b = OrderRequest::open(self.quotes.instrument(LegSlot::B).clone(), side_b, qty_b);
        let Ok(order_b) = self.submit(level, LegSlot::B, OrderPurpose::OpenLeg, request_b) else {
            // A late fill on the first leg is flattened by the orphan guard.
            self.safe_cancel(&order_a);
            return false;
        };

        let id = self.next_transaction_id();
        let notional = 2.0 * per_leg;
        self.open_txs.insert(
            id,
            OpenTransaction {
                id,
                level,
                legs: [
                    OpenLeg::new(order_a, side_a, qty_a),
                    OpenLeg::new(order_b, side_b, qty_b),
                ],
                notional,
                submitted_at: now,
            },
        );
        self.ledger.reserve(notional);
        self.ladder.level_mut(level).state = LevelState::OpenPending;
        log::info!(
            "[OPEN] level={:.4}% A {:?} qty={} / B {:?} qty={}, pending={:.2}",
            self.ladder.threshold(level) * 100.0,
            side_a,
            qty_a,
            side_b,
            qty_b,
            self.ledger.pending()
        );
        true
    }

    pub(super) fn on_open_leg_filled(&mut self, id: TransactionId, slot: LegSlot, quantity: Decimal) {
        let Some(tx) = self.open_txs.get_mut(&id) else {
            return;
        };
        let leg = &mut tx.legs[slot.index()];
        leg.filled = true;
        leg.filled_qty += quantity;
        log::debug!(
            "[OPEN] leg {:?} filled for level={:.4}% qty={}",
            slot,
            self.ladder.threshold(tx.level) * 100.0,
            leg.filled_qty
        );
        if tx.filled_legs() < 2 {
            return;
        }

        let Some(tx) = self.open_txs.remove(&id) else {
            return;
        };
        self.ledger.confirm(tx.notional);
        let held = |leg: &OpenLeg| HeldLeg {
            handle: PositionHandle::Order(leg.order.clone()),
            side: Some(leg.side),
            quantity: Some(leg.filled_qty),
        };
        let level = self.ladder.level_mut(tx.level);
        level.state = LevelState::Open;
        level.legs = [Some(held(&tx.legs[0])), Some(held(&tx.legs[1]))];
        log::info!(
            "[OPEN] both legs filled for level={:.4}%, moved {:.2} from pending to confirmed (confirmed={:.2}, pending={:.2})",
            self.ladder.threshold(tx.level) * 100.0,
            tx.notional,
            self.ledger.confirmed(),
            self.ledger.pending()
        );
    }

    /// The leg at `slot` was rejected or cancelled by the venue: unwind the transaction.
    pub(super) fn on_open_leg_failed(&mut self, id: TransactionId, slot: LegSlot) {
        let Some(tx) = self.open_txs.remove(&id) else {
            return;
        };
        if tx.leg(slot.other()).filled {
            log::warn!(
                "[OPEN] leg {:?} failed after leg {:?} filled at level={:.4}%, closing the filled leg",
                slot,
                slot.other(),
                self.ladder.threshold(tx.level) * 100.0
            );
        }
        self.unwind_open(tx);
    }

    /// Resolves opens that outlived the order timeout. Opens with both legs filled are left
    /// alone; the fill path has already resolved them.
    pub(super) fn check_open_timeouts(&mut self, now: Instant) {
        let timeout = self.order_timeout();
        let expired: Vec<TransactionId> = self
            .open_txs
            .values()
            .filter(|tx| now.saturating_duration_since(tx.submitted_at) >= timeout)
            .filter(|tx| tx.filled_legs() < 2)
            .map(|tx| tx.id)
            .collect();

        for id in expired {
            let Some(tx) = self.open_txs.remove(&id) else {
                continue;
            };
            let level = self.ladder.threshold(tx.level);
            let filled = LegSlot::BOTH.into_iter().find(|slot| tx.leg(*slot).filled);
            match filled {
                Some(filled) => self.raise(GridError::PartialFillImbalance { level, filled }),
                None => self.raise(GridError::OrderTimeout {
                    level,
                    closing: false,
                }),
            }
            self.unwind_open(tx);
        }
    }

    /// Abandons an in-flight open regardless of age (kill switch).
    pub(super) fn abort_open_for_level(&mut self, level: usize) {
        let ids: Vec<TransactionId> = self
            .open_txs
            .values()
            .filter(|tx| tx.level == level)
            .map(|tx| tx.id)
            .collect();
        for id in ids {
            if let Some(tx) = self.open_txs.remove(&id) {
                log::warn!(
                    "[OPEN] aborting in-flight open for level={:.4}%",
                    self.ladder.threshold(level) * 100.0
                );
                self.unwind_open(tx);
            }
        }
    }

    /// Cancels unfilled legs, flattens filled ones, releases the reservation and frees the level.
    fn unwind_open(&mut self, tx: OpenTransaction) {
        for slot in LegSlot::BOTH {
            let leg = tx.leg(slot);
            if leg.filled {
                self.submit_corrective_close(tx.level, slot, leg.side, leg.filled_qty);
            } else {
                self.safe_cancel(&leg.order);
            }
        }
        self.ledger.release(tx.notional);
        self.ladder.level_mut(tx.level).clear();
        log::info!(
            "[OPEN] unwound level={:.4}%, released {:.2} (pending={:.2})",
            self.ladder.threshold(tx.level) * 100.0,
            tx.notional,
            self.ledger.pending()
        );
    }
}
