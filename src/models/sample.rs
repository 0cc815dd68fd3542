//! Price samples and the events a feed subscription yields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed price point. Ordered by timestamp within a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PriceSample {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}

/// Why a discontinuity appeared in the sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapReason {
    /// The transport dropped and the subscription resumed after reconnect.
    /// Samples during the downtime are lost, never interpolated.
    Reconnect,
    /// The consumer fell behind the bounded channel and the oldest `n`
    /// events were discarded.
    Lagged(u64),
}

/// Item yielded by a feed subscription: either a fresh sample or a marker
/// that the stream has a hole in it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedEvent {
    Sample(PriceSample),
    Gap(GapReason),
}
