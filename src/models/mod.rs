//! Shared data models spanning the engine layers.

pub mod instrument;
pub mod sample;
pub mod signal;

pub use instrument::{Instrument, Timeframe};
pub use sample::{FeedEvent, GapReason, PriceSample};
pub use signal::{Signal, SignalAction};
