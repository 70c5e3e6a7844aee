use anyhow::Result;
use std::time::{Duration, Instant};

use super::types::EngineEvent;
use super::GridEngine;
use crate::ports::execution::EventFeed;
use crate::ports::paper_venue::PaperVenue;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub events: usize,
    pub venue_events: usize,
    pub incidents: usize,
}

impl GridEngine {
    /// Drives the engine from `feed` until it is exhausted. The clock follows the feed's
    /// timestamps, so timeouts and intervals behave as they would have live. Events the
    /// paper venue produces are fed back after every dispatched event.
    pub async fn run(&mut self, feed: &mut dyn EventFeed, venue: &PaperVenue) -> Result<RunSummary> {
        let base = Instant::now();
        let mut first_ts: Option<i64> = None;
        let mut summary = RunSummary::default();

        while let Some((ts, event)) = feed.next_event().await? {
            let origin = *first_ts.get_or_insert(ts);
            let now = base + Duration::from_millis(ts.saturating_sub(origin).max(0) as u64);

            if let EngineEvent::QuoteUpdate(quote) = &event {
                venue.on_quote(quote);
            }
            summary.events += 1;
            summary.incidents += self.handle_event(event, now).len();

            loop {
                let pending = venue.take_events();
                if pending.is_empty() {
                    break;
                }
                for venue_event in pending {
                    summary.venue_events += 1;
                    summary.incidents += self.handle_event(venue_event, now).len();
                }
            }
        }

        log::info!(
            "[REPLAY] finished: events={} venue_events={} incidents={} confirmed={:.2} pending={:.2}",
            summary.events,
            summary.venue_events,
            summary.incidents,
            self.ledger.confirmed(),
            self.ledger.pending()
        );
        Ok(summary)
    }
}
