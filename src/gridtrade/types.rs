use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentId(pub String);

impl InstrumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque order identifier handed out by the execution venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderHandle(pub String);

impl fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies what backs a held leg: the order that opened it, or a startup placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PositionHandle {
    Order(OrderHandle),
    ManualOverride,
    Detected,
}

impl fmt::Display for PositionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionHandle::Order(handle) => write!(f, "{}", handle),
            PositionHandle::ManualOverride => f.write_str("MANUAL_OVERRIDE"),
            PositionHandle::Detected => f.write_str("DETECTED"),
        }
    }
}

/// The two instruments of the pair. `A` is the numerator of the spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LegSlot {
    A,
    B,
}

impl LegSlot {
    pub const BOTH: [LegSlot; 2] = [LegSlot::A, LegSlot::B];

    pub fn index(self) -> usize {
        match self {
            LegSlot::A => 0,
            LegSlot::B => 1,
        }
    }

    pub fn other(self) -> LegSlot {
        match self {
            LegSlot::A => LegSlot::B,
            LegSlot::B => LegSlot::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum OrderKind {
    /// Crosses the book immediately.
    Aggressive,
    /// Rests at `offset_bps` from mid on the passive side.
    Passive { offset_bps: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub instrument: InstrumentId,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn open(instrument: InstrumentId, side: Side, quantity: Decimal) -> Self {
        Self {
            instrument,
            side,
            kind: OrderKind::Aggressive,
            quantity,
            reduce_only: false,
            time_in_force: TimeInForce::Ioc,
        }
    }

    pub fn close(instrument: InstrumentId, side: Side, quantity: Decimal, kind: OrderKind) -> Self {
        let time_in_force = match kind {
            OrderKind::Aggressive => TimeInForce::Ioc,
            OrderKind::Passive { .. } => TimeInForce::Gtc,
        };
        Self {
            instrument,
            side,
            kind,
            quantity,
            reduce_only: true,
            time_in_force,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: InstrumentId,
    pub bid: f64,
    pub ask: f64,
    /// Venue timestamp in milliseconds.
    pub timestamp: i64,
}

/// Everything the engine reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    QuoteUpdate(Quote),
    OrderAccepted {
        order: OrderHandle,
    },
    OrderRejected {
        order: OrderHandle,
        reason: String,
    },
    OrderFilled {
        order: OrderHandle,
        quantity: Decimal,
    },
    OrderCanceled {
        order: OrderHandle,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub instrument: InstrumentId,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub is_long: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSpec {
    pub id: InstrumentId,
    pub size_step: Decimal,
    pub min_order: Option<Decimal>,
}

/// Rounds `size` down to a multiple of `step`; sizes under `min_order` become zero.
pub fn quantize_size_by_step(size: Decimal, step: Decimal, min_order: Option<Decimal>) -> Decimal {
    if size <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let quantized = if step > Decimal::ZERO {
        (size / step).floor() * step
    } else {
        size
    };
    match min_order {
        Some(min) if quantized < min => Decimal::ZERO,
        _ => quantized.normalize(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantize_rounds_down_to_step() {
        assert_eq!(quantize_size_by_step(dec!(0.12345), dec!(0.001), None), dec!(0.123));
    }

    #[test]
    fn quantize_drops_sizes_below_min_order() {
        assert_eq!(
            quantize_size_by_step(dec!(0.0009), dec!(0.0001), Some(dec!(0.001))),
            Decimal::ZERO
        );
    }

    #[test]
    fn close_requests_are_reduce_only() {
        let req = OrderRequest::close(
            InstrumentId::new("AAA"),
            Side::Sell,
            dec!(1),
            OrderKind::Passive { offset_bps: 2.0 },
        );
        assert!(req.reduce_only);
        assert_eq!(req.time_in_force, TimeInForce::Gtc);
    }
}
