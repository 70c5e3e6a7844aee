//! In-flight closes of an occupied level. Occupancy and confirmed notional only change
//! once both legs report closed.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::time::Instant;

use super::error::GridError;
use super::ladder::LevelState;
use super::types::{quantize_size_by_step, LegSlot, OrderHandle, OrderRequest, Side};
use super::{GridEngine, OrderPurpose, OrderState, TransactionId};
use crate::alert_notifier::notify_critical;

const MAX_CLOSE_TIMEOUTS_BEFORE_ALERT: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct CloseLeg {
    /// Current close order; `None` when the last submission produced no order.
    pub order: Option<OrderHandle>,
    pub closed: bool,
    /// Earlier orders for this leg that were cancelled and replaced.
    pub superseded: Vec<OrderHandle>,
}

#[derive(Debug, Clone)]
pub struct CloseTransaction {
    pub id: TransactionId,
    pub level: usize,
    pub legs: [CloseLeg; 2],
    pub submitted_at: Instant,
    pub timeouts: u32,
}

impl CloseTransaction {
    pub fn leg(&self, slot: LegSlot) -> &CloseLeg {
        &self.legs[slot.index()]
    }

    /// Finds the leg `order` belongs to; the flag is set when it is a superseded order.
    pub fn slot_of(&self, order: &OrderHandle) -> Option<(LegSlot, bool)> {
        LegSlot::BOTH.into_iter().find_map(|slot| {
            let leg = self.leg(slot);
            if leg.order.as_ref() == Some(order) {
                Some((slot, false))
            } else if leg.superseded.contains(order) {
                Some((slot, true))
            } else {
                None
            }
        })
    }

    pub fn closed_legs(&self) -> usize {
        self.legs.iter().filter(|leg| leg.closed).count()
    }

    pub fn order_handles(&self) -> impl Iterator<Item = &OrderHandle> {
        self.legs
            .iter()
            .flat_map(|leg| leg.order.iter().chain(leg.superseded.iter()))
    }
}

impl GridEngine {
    /// Sends reduce-only closes for every held leg of an open level. When no order at all
    /// can be produced the level stays `Open` and the next cycle tries again.
    pub(super) fn start_close(&mut self, level: usize, now: Instant) -> bool {
        self.begin_close(level, now, Default::default())
    }

    /// `carried` holds the legs of a close being restarted. Their earlier orders stay attached
    /// as superseded so a late fill on one still closes the leg.
    fn begin_close(&mut self, level: usize, now: Instant, carried: [CloseLeg; 2]) -> bool {
        if self.ladder.level(level).state != LevelState::Open {
            return false;
        }
        if self.close_txs.values().any(|tx| tx.level == level) {
            log::debug!(
                "[CLOSE] already closing level={:.4}%",
                self.ladder.threshold(level) * 100.0
            );
            return false;
        }

        let restarting = carried.iter().any(|leg| !leg.superseded.is_empty());
        let mut legs = carried;
        let mut submitted = 0;
        for slot in LegSlot::BOTH {
            let i = slot.index();
            if self.ladder.level(level).leg(slot).is_none() {
                legs[i].closed = true;
                continue;
            }
            if legs[i].closed {
                continue;
            }
            if restarting && self.held_leg_is_gone(level, slot) {
                log::warn!(
                    "[CLOSE] leg {:?} of level={:.4}% is already flat at the venue",
                    slot,
                    self.ladder.threshold(level) * 100.0
                );
                legs[i].closed = true;
                continue;
            }
            if let Some(order) = self.submit_leg_close(level, slot) {
                legs[i].order = Some(order);
                submitted += 1;
            }
        }
        if submitted == 0 && !restarting {
            return false;
        }

        let id = self.next_transaction_id();
        let done = legs.iter().all(|leg| leg.closed);
        self.close_txs.insert(
            id,
            CloseTransaction {
                id,
                level,
                legs,
                submitted_at: now,
                timeouts: 0,
            },
        );
        self.ladder.level_mut(level).state = LevelState::ClosePending;
        log::info!(
            "[CLOSE] submitted close for level={:.4}% ({} order(s))",
            self.ladder.threshold(level) * 100.0,
            submitted
        );
        if done {
            self.finish_close(id);
        }
        true
    }

    pub(super) fn on_close_leg_filled(
        &mut self,
        id: TransactionId,
        slot: LegSlot,
        superseded: bool,
        order: &OrderHandle,
        quantity: Decimal,
    ) {
        let Some(tx) = self.close_txs.get_mut(&id) else {
            return;
        };
        let level = tx.level;
        let leg = &mut tx.legs[slot.index()];
        if leg.closed {
            // A second order on the leg got through as well; put the extra back.
            log::warn!(
                "[CLOSE] leg {:?} of level={:.4}% closed twice by {} qty={}, restoring",
                slot,
                self.ladder.threshold(level) * 100.0,
                order,
                quantity
            );
            if let Some(side) = self.orders.get(order).map(|wo| wo.request.side) {
                self.submit_restore(level, slot, side, quantity);
            }
            return;
        }
        leg.closed = true;
        let replacement = if superseded { leg.order.clone() } else { None };
        log::info!(
            "[CLOSE] leg {:?} closed for level={:.4}%",
            slot,
            self.ladder.threshold(level) * 100.0
        );
        let done = tx.closed_legs() == 2;
        if let Some(replacement) = replacement {
            // The stale order got there first; the replacement must not close twice.
            self.safe_cancel(&replacement);
        }
        if done {
            self.finish_close(id);
        }
    }

    /// Close legs whose order could not be submitted are retried every cycle.
    pub(super) fn retry_missing_close_orders(&mut self, now: Instant) {
        let missing: Vec<(TransactionId, usize, LegSlot)> = self
            .close_txs
            .values()
            .flat_map(|tx| {
                LegSlot::BOTH
                    .into_iter()
                    .filter(move |slot| {
                        let leg = tx.leg(*slot);
                        leg.order.is_none() && !leg.closed
                    })
                    .map(move |slot| (tx.id, tx.level, slot))
            })
            .collect();

        for (id, level, slot) in missing {
            let Some(order) = self.submit_leg_close(level, slot) else {
                continue;
            };
            if let Some(tx) = self.close_txs.get_mut(&id) {
                tx.legs[slot.index()].order = Some(order);
                tx.submitted_at = now;
            }
        }
    }

    pub(super) fn check_close_timeouts(&mut self, now: Instant) {
        let timeout = self.order_timeout();
        let expired: Vec<TransactionId> = self
            .close_txs
            .values()
            .filter(|tx| now.saturating_duration_since(tx.submitted_at) >= timeout)
            .map(|tx| tx.id)
            .collect();

        for id in expired {
            let Some((level, closed, timeouts)) = self.close_txs.get_mut(&id).map(|tx| {
                tx.timeouts += 1;
                (tx.level, tx.closed_legs(), tx.timeouts)
            }) else {
                continue;
            };
            if closed == 2 {
                self.finish_close(id);
                continue;
            }

            self.raise(GridError::OrderTimeout {
                level: self.ladder.threshold(level),
                closing: true,
            });
            if timeouts == MAX_CLOSE_TIMEOUTS_BEFORE_ALERT {
                let detail = format!(
                    "close of level={:.4}% timed out {} times, still retrying",
                    self.ladder.threshold(level) * 100.0,
                    timeouts
                );
                log::error!("🚨 [CLOSE] {}", detail);
                notify_critical("close_retries", &detail);
            }

            if closed == 1 {
                self.retry_remaining_leg(id, now);
            } else {
                self.restart_close(id, now);
            }
        }
    }

    /// One leg closed, the other did not: replace the stale order and keep the transaction,
    /// unless the venue shows the leg is already gone.
    fn retry_remaining_leg(&mut self, id: TransactionId, now: Instant) {
        let Some(tx) = self.close_txs.get(&id) else {
            return;
        };
        let level = tx.level;
        let Some(slot) = LegSlot::BOTH.into_iter().find(|slot| !tx.leg(*slot).closed) else {
            return;
        };
        let stale = tx.leg(slot).order.clone();
        if let Some(stale) = &stale {
            self.safe_cancel(stale);
        }

        if self.held_leg_is_gone(level, slot) {
            log::warn!(
                "[CLOSE] leg {:?} of level={:.4}% is already flat at the venue, clearing the level",
                slot,
                self.ladder.threshold(level) * 100.0
            );
            if let Some(tx) = self.close_txs.get_mut(&id) {
                let leg = &mut tx.legs[slot.index()];
                leg.closed = true;
                leg.superseded.extend(stale);
                leg.order = None;
            }
            self.finish_close(id);
            return;
        }

        log::error!(
            "🚨 [CLOSE] imbalanced close at level={:.4}%: leg {:?} closed, leg {:?} still open, retrying",
            self.ladder.threshold(level) * 100.0,
            slot.other(),
            slot
        );
        let replacement = self.submit_leg_close(level, slot);
        if let Some(tx) = self.close_txs.get_mut(&id) {
            let leg = &mut tx.legs[slot.index()];
            leg.superseded.extend(stale);
            leg.order = replacement;
            tx.submitted_at = now;
        }
    }

    /// Neither leg closed: cancel both orders and close again, keeping the cancelled orders
    /// attached to their legs.
    fn restart_close(&mut self, id: TransactionId, now: Instant) {
        let Some(tx) = self.close_txs.remove(&id) else {
            return;
        };
        log::warn!(
            "[CLOSE] both close orders timed out for level={:.4}%, retrying",
            self.ladder.threshold(tx.level) * 100.0
        );
        for handle in tx.order_handles() {
            self.safe_cancel(handle);
        }
        let carried = tx.legs.map(|leg| {
            let mut superseded = leg.superseded;
            superseded.extend(leg.order);
            let closed = leg.closed
                || superseded
                    .iter()
                    .any(|handle| self.order_state(handle) == Some(OrderState::Filled));
            CloseLeg {
                order: None,
                closed,
                superseded,
            }
        });
        self.ladder.level_mut(tx.level).state = LevelState::Open;
        self.begin_close(tx.level, now, carried);
        if let Some(restarted) = self.close_txs.values_mut().find(|t| t.level == tx.level) {
            restarted.timeouts = tx.timeouts;
        }
    }

    fn finish_close(&mut self, id: TransactionId) {
        let Some(tx) = self.close_txs.remove(&id) else {
            return;
        };
        let notional = 2.0 * self.ladder.level_notional(tx.level);
        self.ladder.level_mut(tx.level).clear();
        self.ledger.retire(notional);
        log::info!(
            "[CLOSE] level={:.4}% fully closed, reduced confirmed by {:.2} (confirmed={:.2})",
            self.ladder.threshold(tx.level) * 100.0,
            notional,
            self.ledger.confirmed()
        );
    }

    /// True when the venue no longer holds the leg at `slot` of `level`: what it reports for
    /// the instrument, less everything else the engine accounts for there, is under one size step.
    fn held_leg_is_gone(&self, level: usize, slot: LegSlot) -> bool {
        let Some(leg) = self.ladder.level(level).leg(slot) else {
            return true;
        };
        let (Some(reported), Some(others)) = (
            self.reported_position(slot),
            self.tracked_position_excluding(level, slot),
        ) else {
            return false;
        };
        let remaining = reported - others;
        let step = self.specs[slot.index()].size_step;
        let left = match leg.side {
            Some(side) => signed(side, remaining),
            None => remaining.abs(),
        };
        if step > Decimal::ZERO {
            left < step
        } else {
            left <= Decimal::ZERO
        }
    }

    /// Signed position the venue reports for the instrument of `slot`.
    fn reported_position(&self, slot: LegSlot) -> Option<Decimal> {
        let instrument = self.quotes.instrument(slot);
        let positions = match self.positions.open_positions() {
            Ok(positions) => positions,
            Err(e) => {
                log::warn!("[CLOSE] position query failed: {}", e);
                return None;
            }
        };
        let listed: Decimal = positions
            .iter()
            .filter(|p| &p.instrument == instrument)
            .map(|p| if p.is_long { p.quantity } else { -p.quantity })
            .sum();
        if !listed.is_zero() {
            return Some(listed);
        }
        match self.positions.net_exposure(instrument) {
            Ok(Some(exposure)) if exposure != 0.0 => Decimal::from_f64(exposure / self.quotes.mid(slot)?),
            Ok(_) => Some(Decimal::ZERO),
            Err(e) => {
                log::warn!("[CLOSE] net exposure query failed for {}: {}", instrument, e);
                None
            }
        }
    }

    /// Signed position the engine accounts for on `slot` apart from the held leg of `level`:
    /// other held legs, filled legs of opens in flight and exposure a corrective order is
    /// still working on. `None` when a startup placeholder makes the split unknowable.
    fn tracked_position_excluding(&self, level: usize, slot: LegSlot) -> Option<Decimal> {
        let mut total = Decimal::ZERO;
        for (index, other) in self.ladder.levels().iter().enumerate() {
            if index == level {
                continue;
            }
            let Some(leg) = other.leg(slot) else {
                continue;
            };
            let closed = self
                .close_txs
                .values()
                .any(|tx| tx.level == index && tx.leg(slot).closed);
            if !closed {
                total += signed(leg.side?, leg.quantity?);
            }
        }
        for tx in self.open_txs.values() {
            let leg = tx.leg(slot);
            if leg.filled {
                total += signed(leg.side, leg.filled_qty);
            }
        }
        for wo in self.orders.values() {
            if wo.slot == slot
                && wo.state.is_open()
                && matches!(wo.purpose, OrderPurpose::Corrective { .. })
            {
                total -= signed(wo.request.side, wo.request.quantity);
            }
        }
        Some(total)
    }

    /// Submits the close for one held leg, raising `CloseSubmissionFailure` when no order results.
    fn submit_leg_close(&mut self, level: usize, slot: LegSlot) -> Option<OrderHandle> {
        let request = match self.close_request(level, slot) {
            Ok(request) => request,
            Err(detail) => {
                self.raise(GridError::CloseSubmissionFailure {
                    level: self.ladder.threshold(level),
                    slot,
                    detail,
                });
                return None;
            }
        };
        match self.submit(level, slot, OrderPurpose::CloseLeg, request) {
            Ok(order) => Some(order),
            Err(e) => {
                self.raise(GridError::CloseSubmissionFailure {
                    level: self.ladder.threshold(level),
                    slot,
                    detail: e.to_string(),
                });
                None
            }
        }
    }

    /// Close order for a held leg. Startup placeholders carry no side or size, so those are
    /// read from the position source and capped at the level's share.
    fn close_request(&self, level: usize, slot: LegSlot) -> Result<OrderRequest, String> {
        let instrument = self.quotes.instrument(slot).clone();
        let kind = self.close_kind();
        let held = self
            .ladder
            .level(level)
            .leg(slot)
            .ok_or_else(|| "no held leg".to_string())?;
        if let (Some(side), Some(quantity)) = (held.side, held.quantity) {
            if quantity > Decimal::ZERO {
                return Ok(OrderRequest::close(instrument, side.opposite(), quantity, kind));
            }
        }

        let share = self
            .leg_quantity(slot, self.ladder.level_notional(level))
            .ok_or_else(|| format!("no usable mid price for {}", instrument))?;
        let spec = &self.specs[slot.index()];

        let positions = self
            .positions
            .open_positions()
            .map_err(|e| format!("position query failed: {}", e))?;
        if let Some(pos) = positions
            .iter()
            .find(|p| p.instrument == instrument && p.quantity > Decimal::ZERO)
        {
            let side = if pos.is_long {
                Side::Sell
            } else {
                Side::Buy
            };
            let quantity = share.min(pos.quantity);
            return Ok(OrderRequest::close(instrument, side, quantity, kind));
        }

        let exposure = self
            .positions
            .net_exposure(&instrument)
            .map_err(|e| format!("net exposure query failed: {}", e))?
            .filter(|v| *v != 0.0)
            .ok_or_else(|| format!("no open position found for {}", instrument))?;
        let mid = self.quotes.mid(slot).unwrap_or(1.0);
        let held_qty = Decimal::from_f64(exposure.abs() / mid)
            .map(|q| quantize_size_by_step(q, spec.size_step, spec.min_order))
            .unwrap_or(Decimal::ZERO);
        let quantity = share.min(held_qty);
        if quantity <= Decimal::ZERO {
            return Err(format!("exposure on {} below one size step", instrument));
        }
        let side = if exposure > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        };
        Ok(OrderRequest::close(instrument, side, quantity, kind))
    }
}

fn signed(side: Side, quantity: Decimal) -> Decimal {
    match side {
        Side::Buy => quantity,
        Side::Sell => -quantity,
    }
}
