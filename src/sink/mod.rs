//! The sink end of the pipeline: batched delivery to the upstream HTTP
//! endpoint, plus the response bookkeeping that feeds the periodic summary.

use event::Event;
use std::time::Duration;

pub mod honeycomb;
pub mod stats;

pub use self::honeycomb::{verify_write_key, HoneycombConfig, Uploader};
pub use self::stats::ResponseStats;

/// The outcome of one event's delivery attempt, correlated back to the
/// event so a retryable failure can be re-enqueued. Status 0 means the
/// transport failed before any HTTP status existed.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub event: Event,
}
