use async_trait::async_trait;
use std::error::Error;
use std::fmt;

use crate::gridtrade::types::{
    EngineEvent, InstrumentId, InstrumentSpec, OrderHandle, OrderRequest, PositionSnapshot,
};

#[derive(Debug, Clone, PartialEq)]
pub enum VenueError {
    Rejected(String),
    InstrumentNotFound(String),
    Unavailable(String),
}

impl fmt::Display for VenueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VenueError::Rejected(e) => write!(f, "rejected: {}", e),
            VenueError::InstrumentNotFound(e) => write!(f, "instrument not found: {}", e),
            VenueError::Unavailable(e) => write!(f, "venue unavailable: {}", e),
        }
    }
}

impl Error for VenueError {}

/// Order routing. Submission and cancellation are fire-and-forget: outcomes come back
/// later as `EngineEvent`s.
pub trait ExecutionVenue {
    fn resolve_instrument(&self, id: &InstrumentId) -> Result<InstrumentSpec, VenueError>;

    fn submit_order(&self, request: &OrderRequest) -> Result<OrderHandle, VenueError>;

    fn cancel_order(&self, order: &OrderHandle) -> Result<(), VenueError>;
}

/// External truth about what the account actually holds.
pub trait PositionSource {
    fn open_positions(&self) -> Result<Vec<PositionSnapshot>, VenueError>;

    /// Signed net exposure in quote currency; `None` when the venue does not report it.
    fn net_exposure(&self, id: &InstrumentId) -> Result<Option<f64>, VenueError>;
}

/// A stream of timestamped inbound events (quotes and order lifecycle notifications).
#[async_trait]
pub trait EventFeed: Send {
    /// Returns `None` once the feed is exhausted. Timestamps are milliseconds.
    async fn next_event(&mut self) -> anyhow::Result<Option<(i64, EngineEvent)>>;
}
