//! Signal output produced by the crossover strategy.

use crate::models::instrument::Instrument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// A freshly computed signal. Owned by the caller of `get_signal`, never
/// mutated or persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: Instrument,
    pub action: SignalAction,
    /// Timestamp of the sample that produced the signal.
    pub timestamp: DateTime<Utc>,
    /// Fast and slow moving averages at that sample, for operator display.
    pub fast: f64,
    pub slow: f64,
    pub price: f64,
}
