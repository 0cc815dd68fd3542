//! Price feed: persistent WebSocket client for a Deriv-style tick provider.

pub mod client;
pub mod messages;

pub use client::{FeedClient, FeedSubscription, PriceFeed};
