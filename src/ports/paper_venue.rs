use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::execution::{ExecutionVenue, PositionSource, VenueError};
use crate::gridtrade::types::{
    EngineEvent, InstrumentId, InstrumentSpec, OrderHandle, OrderKind, OrderRequest,
    PositionSnapshot, Quote, Side,
};

#[derive(Debug, Clone, Copy, Default)]
struct PaperPosition {
    /// Signed: positive is long.
    quantity: Decimal,
    avg_price: Decimal,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    handle: OrderHandle,
    request: OrderRequest,
    limit: f64,
}

#[derive(Debug)]
struct PaperState {
    next_id: u64,
    quotes: HashMap<InstrumentId, (f64, f64)>,
    positions: HashMap<InstrumentId, PaperPosition>,
    resting: Vec<RestingOrder>,
    events: VecDeque<EngineEvent>,
    rng: StdRng,
}

/// In-process venue for replay runs. Aggressive orders fill at mid as soon as they are
/// submitted; passive orders rest until a later quote crosses their limit. Outcomes are
/// queued as events and handed back through `take_events`.
#[derive(Debug)]
pub struct PaperVenue {
    specs: HashMap<InstrumentId, InstrumentSpec>,
    fill_probability: f64,
    state: Mutex<PaperState>,
}

impl PaperVenue {
    pub fn new(specs: Vec<InstrumentSpec>, fill_probability: f64, seed: u64) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
            fill_probability: fill_probability.clamp(0.0, 1.0),
            state: Mutex::new(PaperState {
                next_id: 0,
                quotes: HashMap::new(),
                positions: HashMap::new(),
                resting: Vec::new(),
                events: VecDeque::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the latest top of book and fills any resting order the quote crosses.
    pub fn on_quote(&self, quote: &Quote) {
        let mut state = self.lock();
        state
            .quotes
            .insert(quote.instrument.clone(), (quote.bid, quote.ask));

        let (crossed, still_resting): (Vec<RestingOrder>, Vec<RestingOrder>) =
            std::mem::take(&mut state.resting)
                .into_iter()
                .partition(|order| {
                    order.request.instrument == quote.instrument
                        && match order.request.side {
                            Side::Buy => quote.ask <= order.limit,
                            Side::Sell => quote.bid >= order.limit,
                        }
                });
        state.resting = still_resting;
        for order in crossed {
            fill(&mut state, &order.handle, &order.request, order.limit);
        }
    }

    pub fn take_events(&self) -> Vec<EngineEvent> {
        self.lock().events.drain(..).collect()
    }

    pub fn resting_orders(&self) -> usize {
        self.lock().resting.len()
    }
}

fn mid_of(state: &PaperState, instrument: &InstrumentId) -> Option<f64> {
    state
        .quotes
        .get(instrument)
        .map(|(bid, ask)| (bid + ask) / 2.0)
}

/// Applies a fill to the position book and queues the fill event.
fn fill(state: &mut PaperState, handle: &OrderHandle, request: &OrderRequest, price: f64) {
    let mut quantity = request.quantity;
    let held = state
        .positions
        .get(&request.instrument)
        .map(|p| p.quantity)
        .unwrap_or(Decimal::ZERO);
    if request.reduce_only {
        let reducible = if !held.is_zero() && held.is_sign_positive() == (request.side == Side::Sell) {
            held.abs()
        } else {
            Decimal::ZERO
        };
        quantity = quantity.min(reducible);
        if quantity <= Decimal::ZERO {
            state.events.push_back(EngineEvent::OrderRejected {
                order: handle.clone(),
                reason: "reduce-only order would increase position".to_string(),
            });
            return;
        }
    }

    let signed = match request.side {
        Side::Buy => Decimal::ONE,
        Side::Sell => -Decimal::ONE,
    };
    let position = state
        .positions
        .entry(request.instrument.clone())
        .or_default();
    let price_dec = Decimal::from_f64(price).unwrap_or(Decimal::ZERO);
    let before = position.quantity;
    let after = before + signed * quantity;
    if before.is_zero() || before.is_sign_positive() != after.is_sign_positive() {
        position.avg_price = price_dec;
    } else if after.abs() > before.abs() {
        position.avg_price =
            (position.avg_price * before.abs() + price_dec * quantity) / after.abs();
    }
    position.quantity = after;
    if after.is_zero() {
        state.positions.remove(&request.instrument);
    }

    log::debug!(
        "[REPLAY] paper fill {} {:?} {} qty={} price={:.4}",
        handle,
        request.side,
        request.instrument,
        quantity,
        price
    );
    state.events.push_back(EngineEvent::OrderFilled {
        order: handle.clone(),
        quantity,
    });
}

impl ExecutionVenue for PaperVenue {
    fn resolve_instrument(&self, id: &InstrumentId) -> Result<InstrumentSpec, VenueError> {
        self.specs
            .get(id)
            .cloned()
            .ok_or_else(|| VenueError::InstrumentNotFound(id.to_string()))
    }

    fn submit_order(&self, request: &OrderRequest) -> Result<OrderHandle, VenueError> {
        if !self.specs.contains_key(&request.instrument) {
            return Err(VenueError::InstrumentNotFound(request.instrument.to_string()));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(VenueError::Rejected(format!(
                "non-positive quantity {}",
                request.quantity
            )));
        }

        let mut state = self.lock();
        let mid = mid_of(&state, &request.instrument).ok_or_else(|| {
            VenueError::Unavailable(format!("no quote yet for {}", request.instrument))
        })?;
        state.next_id += 1;
        let handle = OrderHandle(format!("PAPER-{}", state.next_id));
        state.events.push_back(EngineEvent::OrderAccepted {
            order: handle.clone(),
        });

        if self.fill_probability < 1.0 && !state.rng.gen_bool(self.fill_probability) {
            state.events.push_back(EngineEvent::OrderRejected {
                order: handle.clone(),
                reason: "paper venue random rejection".to_string(),
            });
            return Ok(handle);
        }

        match request.kind {
            OrderKind::Aggressive => fill(&mut state, &handle, request, mid),
            OrderKind::Passive { offset_bps } => {
                let offset = mid * offset_bps / 10_000.0;
                let limit = match request.side {
                    Side::Buy => mid - offset,
                    Side::Sell => mid + offset,
                };
                state.resting.push(RestingOrder {
                    handle: handle.clone(),
                    request: request.clone(),
                    limit,
                });
            }
        }
        Ok(handle)
    }

    /// Cancelling an order that already filled is a no-op; its fill event still arrives.
    fn cancel_order(&self, order: &OrderHandle) -> Result<(), VenueError> {
        let mut state = self.lock();
        if let Some(pos) = state.resting.iter().position(|r| &r.handle == order) {
            state.resting.remove(pos);
            state.events.push_back(EngineEvent::OrderCanceled {
                order: order.clone(),
            });
        }
        Ok(())
    }
}

impl PositionSource for PaperVenue {
    fn open_positions(&self) -> Result<Vec<PositionSnapshot>, VenueError> {
        let state = self.lock();
        Ok(state
            .positions
            .iter()
            .map(|(instrument, pos)| PositionSnapshot {
                instrument: instrument.clone(),
                quantity: pos.quantity.abs(),
                avg_price: pos.avg_price,
                is_long: pos.quantity.is_sign_positive(),
            })
            .collect())
    }

    fn net_exposure(&self, id: &InstrumentId) -> Result<Option<f64>, VenueError> {
        let state = self.lock();
        let Some(pos) = state.positions.get(id) else {
            return Ok(Some(0.0));
        };
        let price = mid_of(&state, id).or_else(|| pos.avg_price.to_f64());
        Ok(price.and_then(|p| pos.quantity.to_f64().map(|q| q * p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue(fill_probability: f64) -> PaperVenue {
        let spec = |id: &str| InstrumentSpec {
            id: InstrumentId::new(id),
            size_step: dec!(0.001),
            min_order: None,
        };
        let venue = PaperVenue::new(vec![spec("AAA"), spec("BBB")], fill_probability, 7);
        venue.on_quote(&quote("AAA", 99.0, 101.0));
        venue.on_quote(&quote("BBB", 49.0, 51.0));
        venue
    }

    fn quote(id: &str, bid: f64, ask: f64) -> Quote {
        Quote {
            instrument: InstrumentId::new(id),
            bid,
            ask,
            timestamp: 0,
        }
    }

    #[test]
    fn aggressive_orders_fill_at_mid() {
        let venue = venue(1.0);
        let req = OrderRequest::open(InstrumentId::new("AAA"), Side::Sell, dec!(2));
        let handle = venue.submit_order(&req).unwrap();
        let events = venue.take_events();
        assert_eq!(
            events,
            vec![
                EngineEvent::OrderAccepted {
                    order: handle.clone()
                },
                EngineEvent::OrderFilled {
                    order: handle,
                    quantity: dec!(2)
                },
            ]
        );
        let positions = venue.open_positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert!(!positions[0].is_long);
        assert_eq!(positions[0].avg_price, dec!(100));
        assert_eq!(
            venue.net_exposure(&InstrumentId::new("AAA")).unwrap(),
            Some(-200.0)
        );
    }

    #[test]
    fn reduce_only_is_capped_and_rejected_when_flat() {
        let venue = venue(1.0);
        let open = OrderRequest::open(InstrumentId::new("BBB"), Side::Buy, dec!(1));
        venue.submit_order(&open).unwrap();
        venue.take_events();

        let close = OrderRequest::close(
            InstrumentId::new("BBB"),
            Side::Sell,
            dec!(5),
            OrderKind::Aggressive,
        );
        let handle = venue.submit_order(&close).unwrap();
        assert!(venue.take_events().contains(&EngineEvent::OrderFilled {
            order: handle,
            quantity: dec!(1)
        }));
        assert!(venue.open_positions().unwrap().is_empty());

        let handle = venue.submit_order(&close).unwrap();
        assert!(matches!(
            venue.take_events().last(),
            Some(EngineEvent::OrderRejected { order, .. }) if *order == handle
        ));
    }

    #[test]
    fn passive_orders_rest_until_crossed() {
        let venue = venue(1.0);
        venue
            .submit_order(&OrderRequest::open(InstrumentId::new("AAA"), Side::Buy, dec!(1)))
            .unwrap();
        venue.take_events();

        let close = OrderRequest::close(
            InstrumentId::new("AAA"),
            Side::Sell,
            dec!(1),
            OrderKind::Passive { offset_bps: 2.0 },
        );
        let handle = venue.submit_order(&close).unwrap();
        venue.take_events();
        assert_eq!(venue.resting_orders(), 1);

        venue.on_quote(&quote("AAA", 100.0, 100.5));
        assert!(venue.take_events().is_empty());
        venue.on_quote(&quote("AAA", 100.1, 100.6));
        assert_eq!(
            venue.take_events(),
            vec![EngineEvent::OrderFilled {
                order: handle,
                quantity: dec!(1)
            }]
        );
        assert_eq!(venue.resting_orders(), 0);
    }

    #[test]
    fn cancel_removes_resting_order() {
        let venue = venue(1.0);
        venue
            .submit_order(&OrderRequest::open(InstrumentId::new("AAA"), Side::Buy, dec!(1)))
            .unwrap();
        let close = OrderRequest::close(
            InstrumentId::new("AAA"),
            Side::Sell,
            dec!(1),
            OrderKind::Passive { offset_bps: 50.0 },
        );
        let handle = venue.submit_order(&close).unwrap();
        venue.take_events();
        venue.cancel_order(&handle).unwrap();
        assert_eq!(
            venue.take_events(),
            vec![EngineEvent::OrderCanceled { order: handle }]
        );
    }

    #[test]
    fn unknown_instrument_is_not_found() {
        let venue = venue(1.0);
        assert_eq!(
            venue.resolve_instrument(&InstrumentId::new("ZZZ")),
            Err(VenueError::InstrumentNotFound("ZZZ".to_string()))
        );
    }

    #[test]
    fn zero_fill_probability_rejects_everything() {
        let venue = venue(0.0);
        let handle = venue
            .submit_order(&OrderRequest::open(InstrumentId::new("AAA"), Side::Buy, dec!(1)))
            .unwrap();
        assert!(matches!(
            venue.take_events().last(),
            Some(EngineEvent::OrderRejected { order, .. }) if *order == handle
        ));
        assert!(venue.open_positions().unwrap().is_empty());
    }
}
