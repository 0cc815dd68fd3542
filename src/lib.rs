//! tickflow: on-demand trading-signal engine.
//!
//! A persistent WebSocket client consumes live ticks from a Deriv-style
//! market-data provider, per-instrument bounded buffers keep the trailing
//! sample window, and a moving-average crossover strategy answers
//! BUY/SELL/HOLD queries on demand. Signals only; no order execution.

pub mod buffer;
pub mod common;
pub mod config;
pub mod error;
pub mod feed;
pub mod logging;
pub mod models;
pub mod service;
pub mod strategy;

pub use error::{Result, SignalError};
