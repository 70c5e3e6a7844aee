pub mod close_tracker;
pub mod error;
pub mod kill_switch;
pub mod ladder;
pub mod ledger;
pub mod open_tracker;
pub mod quotes;
pub mod reconcile;
pub mod runner;
pub mod startup;
pub mod types;


use anyhow::{anyhow, Context, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert_notifier::notify_critical;
use crate::config::{CloseOrderStyle, GridTradeConfig};
use crate::ports::execution::{ExecutionVenue, PositionSource, VenueError};
use close_tracker::CloseTransaction;
use error::{GridError, Severity};
use kill_switch::KillSwitch;
use ladder::{GridLadder, LevelState};
use ledger::RiskLedger;
use open_tracker::OpenTransaction;
use quotes::QuoteAggregator;
use reconcile::ReconciliationLoop;
use startup::StartupSynchronizer;
use types::{
    quantize_size_by_step, EngineEvent, InstrumentSpec, LegSlot, OrderHandle, OrderKind,
    OrderRequest, PositionHandle, Quote, Side,
};

const MAX_CORRECTIVE_RETRIES: u32 = 3;

/// Creation sequence number of a paired transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransactionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderState {
    Submitted,
    Accepted,
    CancelRequested,
    Filled,
    Rejected,
    Canceled,
}

impl OrderState {
    /// Still working at the venue and eligible for a cancel request.
    pub fn is_open(self) -> bool {
        matches!(self, OrderState::Submitted | OrderState::Accepted)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected | OrderState::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderPurpose {
    OpenLeg,
    CloseLeg,
    Corrective { attempt: u32 },
}

#[derive(Debug, Clone)]
struct WorkingOrder {
    level: usize,
    slot: LegSlot,
    purpose: OrderPurpose,
    state: OrderState,
    request: OrderRequest,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelSnapshot {
    pub threshold: f64,
    pub weight: f64,
    pub state: LevelState,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub spread: Option<f64>,
    pub confirmed_notional: f64,
    pub pending_notional: f64,
    pub open_in_flight: usize,
    pub close_in_flight: usize,
    pub working_orders: usize,
    pub levels: Vec<LevelSnapshot>,
}

/// Owns the ladder, the ledger and both tracker maps. Every mutation goes through
/// `handle_event`, one event at a time.
pub struct GridEngine {
    cfg: GridTradeConfig,
    venue: Arc<dyn ExecutionVenue + Send + Sync>,
    positions: Arc<dyn PositionSource + Send + Sync>,
    specs: [InstrumentSpec; 2],
    quotes: QuoteAggregator,
    ladder: GridLadder,
    ledger: RiskLedger,
    open_txs: BTreeMap<TransactionId, OpenTransaction>,
    close_txs: BTreeMap<TransactionId, CloseTransaction>,
    orders: HashMap<OrderHandle, WorkingOrder>,
    kill_switch: KillSwitch,
    startup: StartupSynchronizer,
    reconciler: ReconciliationLoop,
    next_tx_id: u64,
    started_at: Option<Instant>,
    incidents: Vec<GridError>,
}

impl GridEngine {
    /// Fails when the config is invalid or either instrument cannot be resolved.
    pub fn new(
        cfg: GridTradeConfig,
        venue: Arc<dyn ExecutionVenue + Send + Sync>,
        positions: Arc<dyn PositionSource + Send + Sync>,
    ) -> Result<Self> {
        cfg.validate().context("invalid grid config")?;

        let resolve = |raw: &str| -> Result<InstrumentSpec> {
            let id = types::InstrumentId::new(raw);
            venue.resolve_instrument(&id).map_err(|e| match e {
                VenueError::InstrumentNotFound(_) => anyhow::Error::new(GridError::InstrumentNotFound(id)),
                other => anyhow!("failed to resolve instrument {}: {}", raw, other),
            })
        };
        let spec_a = resolve(&cfg.instrument_a)?;
        let spec_b = resolve(&cfg.instrument_b)?;

        log::info!(
            "[GRID] pair {} / {} levels={:?} base_notional={} max_total_notional={}",
            spec_a.id,
            spec_b.id,
            cfg.grid_levels,
            cfg.base_notional_per_level,
            cfg.max_total_notional
        );

        let quotes = QuoteAggregator::new(spec_a.id.clone(), spec_b.id.clone());
        let ladder = GridLadder::new(
            &cfg.grid_levels,
            &cfg.level_weights,
            cfg.base_notional_per_level,
        );
        let ledger = RiskLedger::new(cfg.max_total_notional);
        let kill_switch = KillSwitch::new(cfg.extreme_spread_stop);
        let startup = StartupSynchronizer::new(
            cfg.startup_delay(),
            cfg.initial_notional_override,
            cfg.startup_estimate,
        );
        let reconciler = ReconciliationLoop::new(
            cfg.reconciliation_interval(),
            cfg.drift_threshold,
            cfg.imbalance_alert_ratio,
        );

        Ok(Self {
            cfg,
            venue,
            positions,
            specs: [spec_a, spec_b],
            quotes,
            ladder,
            ledger,
            open_txs: BTreeMap::new(),
            close_txs: BTreeMap::new(),
            orders: HashMap::new(),
            kill_switch,
            startup,
            reconciler,
            next_tx_id: 0,
            started_at: None,
            incidents: Vec::new(),
        })
    }

    /// Processes one inbound event against the monotonic clock reading `now` and returns
    /// the incidents raised (and already recovered) while doing so. The settle delay is
    /// measured from the first event seen.
    pub fn handle_event(&mut self, event: EngineEvent, now: Instant) -> Vec<GridError> {
        let started_at = *self.started_at.get_or_insert(now);
        match event {
            EngineEvent::QuoteUpdate(quote) => self.on_quote(&quote, started_at, now),
            EngineEvent::OrderAccepted { order } => self.on_order_accepted(&order),
            EngineEvent::OrderRejected { order, reason } => self.on_order_rejected(&order, &reason),
            EngineEvent::OrderFilled { order, quantity } => self.on_order_filled(&order, quantity),
            EngineEvent::OrderCanceled { order } => self.on_order_canceled(&order),
        }
        std::mem::take(&mut self.incidents)
    }

    pub fn ledger(&self) -> &RiskLedger {
        &self.ledger
    }

    pub fn ladder(&self) -> &GridLadder {
        &self.ladder
    }

    pub fn spread(&self) -> Option<f64> {
        self.quotes.spread()
    }

    pub fn is_synced(&self) -> bool {
        self.startup.is_synced()
    }

    pub fn open_in_flight(&self) -> usize {
        self.open_txs.len()
    }

    pub fn close_in_flight(&self) -> usize {
        self.close_txs.len()
    }

    pub fn order_state(&self, order: &OrderHandle) -> Option<OrderState> {
        self.orders.get(order).map(|wo| wo.state)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            spread: self.quotes.spread(),
            confirmed_notional: self.ledger.confirmed(),
            pending_notional: self.ledger.pending(),
            open_in_flight: self.open_txs.len(),
            close_in_flight: self.close_txs.len(),
            working_orders: self.orders.len(),
            levels: self
                .ladder
                .levels()
                .iter()
                .map(|level| LevelSnapshot {
                    threshold: level.threshold,
                    weight: level.weight,
                    state: level.state,
                })
                .collect(),
        }
    }

    fn on_quote(&mut self, quote: &Quote, started_at: Instant, now: Instant) {
        if !self.quotes.update(quote) {
            log::debug!(
                "[QUOTE] ignored quote for {} bid={} ask={}",
                quote.instrument,
                quote.bid,
                quote.ask
            );
            return;
        }
        if !self.quotes.has_valid_quotes() {
            return;
        }
        if !self.startup.is_synced() {
            if !self.startup.ready(started_at, now) {
                return;
            }
            self.run_startup_sync(now);
        }
        let Some(spread) = self.quotes.spread() else {
            return;
        };

        if let Some(err) = self.kill_switch.check(spread) {
            self.raise(err);
            self.close_all(now);
        } else {
            self.run_close_pass(spread, now);
            self.run_open_pass(spread, now);
        }

        self.retry_missing_close_orders(now);
        self.check_open_timeouts(now);
        self.check_close_timeouts(now);
        self.prune_orders();

        if self.reconciler.due(now) {
            self.reconcile(now);
        }
    }

    fn run_close_pass(&mut self, spread: f64, now: Instant) {
        for index in self.ladder.close_candidates(spread.abs()) {
            log::info!(
                "[GRID] closing level={:.4}% spread={:.4}%",
                self.ladder.threshold(index) * 100.0,
                spread * 100.0
            );
            self.start_close(index, now);
        }
    }

    fn run_open_pass(&mut self, spread: f64, now: Instant) {
        for index in self.ladder.open_candidates(spread.abs()) {
            let requested = 2.0 * self.ladder.level_notional(index);
            if !self.ledger.can_open(requested) {
                log::warn!(
                    "[RISK] max total notional reached (confirmed={:.2}, pending={:.2}, would_add={:.2}), skip level={:.4}%",
                    self.ledger.confirmed(),
                    self.ledger.pending(),
                    requested,
                    self.ladder.threshold(index) * 100.0
                );
                continue;
            }
            log::info!(
                "[GRID] opening level={:.4}% spread={:.4}%",
                self.ladder.threshold(index) * 100.0,
                spread * 100.0
            );
            self.start_open(index, spread, now);
        }
    }

    fn on_order_accepted(&mut self, order: &OrderHandle) {
        if let Some(wo) = self.orders.get_mut(order) {
            if wo.state == OrderState::Submitted {
                wo.state = OrderState::Accepted;
            }
        }
        log::debug!("[ORDER] accepted {}", order);
    }

    fn on_order_rejected(&mut self, order: &OrderHandle, reason: &str) {
        let working = self.orders.get_mut(order).map(|wo| {
            wo.state = OrderState::Rejected;
            wo.clone()
        });

        if let Some((id, slot)) = self.find_open_leg(order) {
            if let Some(level) = self.open_txs.get(&id).map(|tx| tx.level) {
                self.raise_rejection(level, order, reason);
            }
            self.on_open_leg_failed(id, slot);
            return;
        }
        if let Some((id, _, _)) = self.find_close_leg(order) {
            let level = self.close_txs.get(&id).map(|tx| tx.level);
            if let Some(level) = level {
                self.raise_rejection(level, order, reason);
            }
            return;
        }

        match working {
            Some(
                wo @ WorkingOrder {
                    purpose: OrderPurpose::Corrective { .. },
                    ..
                },
            ) => self.retry_corrective(order, wo, reason),
            Some(_) => log::debug!("[ORDER] late rejection for {}: {}", order, reason),
            None => log::debug!("[ORDER] rejection for unknown order {}: {}", order, reason),
        }
    }

    /// Resubmits a corrective order that failed at the venue, up to `MAX_CORRECTIVE_RETRIES` times.
    fn retry_corrective(&mut self, order: &OrderHandle, working: WorkingOrder, reason: &str) {
        let OrderPurpose::Corrective { attempt } = working.purpose else {
            return;
        };
        if attempt >= MAX_CORRECTIVE_RETRIES {
            self.alert(
                "corrective_close",
                &format!(
                    "corrective order for {} leg {:?} failed {} times, unhedged exposure remains: {}",
                    self.quotes.instrument(working.slot),
                    working.slot,
                    attempt + 1,
                    reason
                ),
            );
            return;
        }
        log::warn!(
            "[ORDER] corrective order {} failed ({}), retry {}/{}",
            order,
            reason,
            attempt + 1,
            MAX_CORRECTIVE_RETRIES
        );
        if let Err(e) = self.submit(
            working.level,
            working.slot,
            OrderPurpose::Corrective {
                attempt: attempt + 1,
            },
            working.request,
        ) {
            self.alert(
                "corrective_close",
                &format!("corrective resubmission failed: {}", e),
            );
        }
    }

    fn on_order_filled(&mut self, order: &OrderHandle, quantity: Decimal) {
        let working = self.orders.get_mut(order).map(|wo| {
            wo.state = OrderState::Filled;
            wo.clone()
        });

        if let Some((id, slot)) = self.find_open_leg(order) {
            self.on_open_leg_filled(id, slot, quantity);
            return;
        }
        if let Some((id, slot, stale)) = self.find_close_leg(order) {
            self.on_close_leg_filled(id, slot, stale, order, quantity);
            return;
        }
        if self.absorb_into_held_leg(order, quantity) {
            return;
        }

        match working {
            Some(WorkingOrder {
                purpose: OrderPurpose::OpenLeg,
                level,
                slot,
                request,
                ..
            }) => {
                log::warn!(
                    "[ORDER] late fill {} qty={} on resolved open leg {:?} level={:.4}%, flattening",
                    order,
                    quantity,
                    slot,
                    self.ladder.threshold(level) * 100.0
                );
                self.submit_corrective_close(level, slot, request.side, quantity);
            }
            Some(WorkingOrder {
                purpose: OrderPurpose::Corrective { .. },
                slot,
                ..
            }) => {
                log::info!(
                    "[ORDER] corrective order {} filled qty={} on {}",
                    order,
                    quantity,
                    self.quotes.instrument(slot)
                );
            }
            Some(WorkingOrder {
                purpose: OrderPurpose::CloseLeg,
                level,
                slot,
                request,
                ..
            }) => {
                log::warn!(
                    "[ORDER] late fill {} qty={} on close order of level={:.4}% with no close in flight, restoring",
                    order,
                    quantity,
                    self.ladder.threshold(level) * 100.0
                );
                self.submit_restore(level, slot, request.side, quantity);
            }
            None => log::warn!("[ORDER] fill for unknown order {} qty={}", order, quantity),
        }
    }

    fn on_order_canceled(&mut self, order: &OrderHandle) {
        let previous = self.orders.get_mut(order).map(|wo| {
            let previous = wo.state;
            if !previous.is_terminal() {
                wo.state = OrderState::Canceled;
            }
            (previous, wo.clone())
        });
        log::debug!("[ORDER] canceled {}", order);

        let Some((previous, working)) = previous else {
            return;
        };
        if previous == OrderState::CancelRequested || previous.is_terminal() {
            return;
        }
        if let OrderPurpose::Corrective { .. } = working.purpose {
            self.retry_corrective(order, working, "canceled by venue");
            return;
        }
        // Unsolicited cancel of an unresolved open leg fails the leg like a rejection.
        if let Some((id, slot)) = self.find_open_leg(order) {
            let unresolved = self
                .open_txs
                .get(&id)
                .filter(|tx| !tx.leg(slot).filled)
                .map(|tx| tx.level);
            if let Some(level) = unresolved {
                self.raise_rejection(level, order, "canceled by venue");
                self.on_open_leg_failed(id, slot);
            }
        }
    }

    fn raise_rejection(&mut self, level: usize, order: &OrderHandle, reason: &str) {
        self.raise(GridError::OrderRejected {
            level: self.ladder.threshold(level),
            order: order.clone(),
            reason: reason.to_string(),
        });
    }

    fn find_open_leg(&self, order: &OrderHandle) -> Option<(TransactionId, LegSlot)> {
        self.open_txs
            .iter()
            .find_map(|(id, tx)| tx.slot_of(order).map(|slot| (*id, slot)))
    }

    /// Returns the transaction, the leg and whether `order` is a superseded order of that leg.
    fn find_close_leg(&self, order: &OrderHandle) -> Option<(TransactionId, LegSlot, bool)> {
        self.close_txs
            .iter()
            .find_map(|(id, tx)| tx.slot_of(order).map(|(slot, stale)| (*id, slot, stale)))
    }

    /// Extra fills on the order that opened a held leg add to that leg.
    fn absorb_into_held_leg(&mut self, order: &OrderHandle, quantity: Decimal) -> bool {
        let handle = PositionHandle::Order(order.clone());
        for index in 0..self.ladder.len() {
            let level = self.ladder.level_mut(index);
            for leg in level.legs.iter_mut().flatten() {
                if leg.handle == handle {
                    let held = leg.quantity.unwrap_or(Decimal::ZERO) + quantity;
                    leg.quantity = Some(held);
                    log::debug!(
                        "[ORDER] additional fill {} qty={} held={}",
                        order,
                        quantity,
                        held
                    );
                    return true;
                }
            }
        }
        false
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        self.next_tx_id += 1;
        TransactionId(self.next_tx_id)
    }

    fn submit(
        &mut self,
        level: usize,
        slot: LegSlot,
        purpose: OrderPurpose,
        request: OrderRequest,
    ) -> std::result::Result<OrderHandle, VenueError> {
        match self.venue.submit_order(&request) {
            Ok(handle) => {
                log::info!(
                    "[ORDER] submitted {} {:?} {:?} {} qty={} reduce_only={} ({:?})",
                    handle,
                    request.kind,
                    request.side,
                    request.instrument,
                    request.quantity,
                    request.reduce_only,
                    purpose
                );
                self.orders.insert(
                    handle.clone(),
                    WorkingOrder {
                        level,
                        slot,
                        purpose,
                        state: OrderState::Submitted,
                        request,
                    },
                );
                Ok(handle)
            }
            Err(e) => {
                log::warn!(
                    "[ORDER] submit failed {:?} {} qty={}: {}",
                    request.side,
                    request.instrument,
                    request.quantity,
                    e
                );
                Err(e)
            }
        }
    }

    /// Cancels only orders still working; terminal or already-cancelling orders are left alone
    /// so a cancel never races a fill that has already been reported.
    fn safe_cancel(&mut self, order: &OrderHandle) {
        let Some(wo) = self.orders.get_mut(order) else {
            log::debug!("[ORDER] skip cancel of unknown order {}", order);
            return;
        };
        if !wo.state.is_open() {
            log::debug!("[ORDER] skip cancel of {} in state {:?}", order, wo.state);
            return;
        }
        match self.venue.cancel_order(order) {
            Ok(()) => {
                wo.state = OrderState::CancelRequested;
                log::debug!("[ORDER] cancel requested {}", order);
            }
            Err(e) => log::error!("[ORDER] cancel failed for {}: {}", order, e),
        }
    }

    /// Flattens `quantity` of a leg that filled on `filled_side` and belongs to no level.
    fn submit_corrective_close(
        &mut self,
        level: usize,
        slot: LegSlot,
        filled_side: Side,
        quantity: Decimal,
    ) {
        let request = OrderRequest::close(
            self.quotes.instrument(slot).clone(),
            filled_side.opposite(),
            quantity,
            OrderKind::Aggressive,
        );
        self.submit_corrective(level, slot, request);
    }

    /// Puts back `quantity` that a close order on `closed_side` took from a leg already closed.
    fn submit_restore(&mut self, level: usize, slot: LegSlot, closed_side: Side, quantity: Decimal) {
        let request = OrderRequest::open(
            self.quotes.instrument(slot).clone(),
            closed_side.opposite(),
            quantity,
        );
        self.submit_corrective(level, slot, request);
    }

    fn submit_corrective(&mut self, level: usize, slot: LegSlot, request: OrderRequest) {
        if request.quantity <= Decimal::ZERO {
            return;
        }
        let (instrument, quantity) = (request.instrument.clone(), request.quantity);
        if let Err(e) = self.submit(
            level,
            slot,
            OrderPurpose::Corrective { attempt: 0 },
            request,
        ) {
            self.alert(
                "corrective_close",
                &format!(
                    "corrective order for {} qty={} could not be submitted: {}",
                    instrument, quantity, e
                ),
            );
        }
    }

    /// Leg quantity for a per-leg notional at the current mid, rounded to the size step.
    fn leg_quantity(&self, slot: LegSlot, notional: f64) -> Option<Decimal> {
        let mid = self.quotes.mid(slot)?;
        let raw = Decimal::from_f64(notional / mid)?;
        let spec = &self.specs[slot.index()];
        let qty = quantize_size_by_step(raw, spec.size_step, spec.min_order);
        (qty > Decimal::ZERO).then_some(qty)
    }

    fn close_kind(&self) -> OrderKind {
        match self.cfg.close_order_style {
            CloseOrderStyle::Aggressive => OrderKind::Aggressive,
            CloseOrderStyle::Passive => OrderKind::Passive {
                offset_bps: self.cfg.maker_offset_bps,
            },
        }
    }

    fn prune_orders(&mut self) {
        let mut referenced: HashSet<OrderHandle> = HashSet::new();
        for tx in self.open_txs.values() {
            referenced.extend(tx.order_handles().cloned());
        }
        for tx in self.close_txs.values() {
            referenced.extend(tx.order_handles().cloned());
        }
        self.orders
            .retain(|handle, wo| !wo.state.is_terminal() || referenced.contains(handle));
    }

    fn order_timeout(&self) -> Duration {
        self.cfg.order_timeout()
    }

    fn raise(&mut self, err: GridError) {
        let tag = incident_tag(&err);
        match err.severity() {
            Severity::Warning => log::warn!("[{}] {}", tag, err),
            Severity::Error => log::error!("[{}] {}", tag, err),
            Severity::Critical => {
                log::error!("🚨 [{}] {}", tag, err);
                notify_critical(err.alert_key(), &err.to_string());
            }
        }
        self.incidents.push(err);
    }

    fn alert(&self, key: &str, detail: &str) {
        log::error!("🚨 [ALERT] {}", detail);
        notify_critical(key, detail);
    }
}

fn incident_tag(err: &GridError) -> &'static str {
    match err {
        GridError::OrderRejected { .. } | GridError::OrderTimeout { .. } => "ORDER",
        GridError::PartialFillImbalance { .. } => "OPEN",
        GridError::ReconciliationDrift { .. } => "RECONCILE",
        GridError::CriticalImbalance { .. } => "ALERT",
        GridError::ExtremeSpread { .. } => "KILL",
        GridError::InstrumentNotFound(_) => "STARTUP",
        GridError::CloseSubmissionFailure { .. } => "CLOSE",
    }
}

fn notional_of(quantity: Decimal, price: f64) -> f64 {
    quantity.abs().to_f64().unwrap_or(0.0) * price
}
