use super::types::{InstrumentId, LegSlot, Quote};

#[derive(Debug, Clone, Copy, PartialEq)]
struct TopOfBook {
    bid: f64,
    ask: f64,
}

impl TopOfBook {
    fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Latest bid/ask for the two instruments of the pair. A quote stays valid until overwritten.
#[derive(Debug)]
pub struct QuoteAggregator {
    instruments: [InstrumentId; 2],
    books: [Option<TopOfBook>; 2],
}

impl QuoteAggregator {
    pub fn new(instrument_a: InstrumentId, instrument_b: InstrumentId) -> Self {
        Self {
            instruments: [instrument_a, instrument_b],
            books: [None, None],
        }
    }

    pub fn slot_of(&self, instrument: &InstrumentId) -> Option<LegSlot> {
        LegSlot::BOTH
            .into_iter()
            .find(|slot| &self.instruments[slot.index()] == instrument)
    }

    pub fn instrument(&self, slot: LegSlot) -> &InstrumentId {
        &self.instruments[slot.index()]
    }

    /// Records the quote; returns false when it is for an instrument outside the pair
    /// or carries a non-positive price.
    pub fn update(&mut self, quote: &Quote) -> bool {
        let Some(slot) = self.slot_of(&quote.instrument) else {
            return false;
        };
        if !(quote.bid > 0.0 && quote.ask > 0.0) || !quote.bid.is_finite() || !quote.ask.is_finite()
        {
            return false;
        }
        self.books[slot.index()] = Some(TopOfBook {
            bid: quote.bid,
            ask: quote.ask,
        });
        true
    }

    pub fn has_valid_quotes(&self) -> bool {
        self.books.iter().all(Option::is_some)
    }

    pub fn mid(&self, slot: LegSlot) -> Option<f64> {
        self.books[slot.index()].map(|book| book.mid())
    }

    /// `(midA - midB) / midB`, or `None` until both instruments have quoted.
    pub fn spread(&self) -> Option<f64> {
        let mid_a = self.mid(LegSlot::A)?;
        let mid_b = self.mid(LegSlot::B)?;
        Some((mid_a - mid_b) / mid_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(id: &str, bid: f64, ask: f64) -> Quote {
        Quote {
            instrument: InstrumentId::new(id),
            bid,
            ask,
            timestamp: 0,
        }
    }

    #[test]
    fn spread_needs_both_instruments() {
        let mut agg = QuoteAggregator::new(InstrumentId::new("A"), InstrumentId::new("B"));
        assert!(agg.update(&quote("A", 100.0, 102.0)));
        assert!(!agg.has_valid_quotes());
        assert_eq!(agg.spread(), None);

        assert!(agg.update(&quote("B", 99.0, 101.0)));
        let spread = agg.spread().unwrap();
        assert!((spread - 0.01).abs() < 1e-12);
    }

    #[test]
    fn foreign_and_broken_quotes_are_ignored() {
        let mut agg = QuoteAggregator::new(InstrumentId::new("A"), InstrumentId::new("B"));
        assert!(!agg.update(&quote("C", 1.0, 1.0)));
        assert!(!agg.update(&quote("A", 0.0, 1.0)));
        assert_eq!(agg.mid(LegSlot::A), None);
    }

    #[test]
    fn latest_quote_overwrites() {
        let mut agg = QuoteAggregator::new(InstrumentId::new("A"), InstrumentId::new("B"));
        agg.update(&quote("A", 10.0, 10.0));
        agg.update(&quote("A", 20.0, 22.0));
        assert_eq!(agg.mid(LegSlot::A), Some(21.0));
    }
}
