//! Runtime configuration, overridable through environment variables.

use crate::error::{Result, SignalError};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Public Deriv v3 endpoint; override the app_id via TICKFLOW_APP_ID.
const DEFAULT_WS_URL: &str = "wss://ws.derivws.com/websockets/v3";
const DEFAULT_APP_ID: &str = "1089";

/// Returns the deployment environment (defaults to "sandbox").
pub fn get_environment() -> String {
    env::var("TICKFLOW_ENV").unwrap_or_else(|_| "sandbox".to_string())
}

/// Configuration for the price feed client.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket endpoint including the app_id query parameter.
    pub url: String,
    /// Optional account token; public tick streams do not need one.
    pub token: Option<String>,
    /// Reconnect backoff floor and ceiling.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Reconnect attempts before the feed fails permanently.
    pub max_reconnects: usize,
    /// Per-instrument event channel capacity. A consumer that falls further behind
    /// than this sees a lag gap instead of stale data.
    pub channel_capacity: usize,
    /// Operator-friendly names mapped to provider symbols.
    pub symbol_map: HashMap<String, String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let mut symbol_map = HashMap::new();
        symbol_map.insert("EURUSD_OTC".to_string(), "frxEURUSD".to_string());
        symbol_map.insert("GBPUSD_OTC".to_string(), "frxGBPUSD".to_string());
        symbol_map.insert("AUDUSD_OTC".to_string(), "frxAUDUSD".to_string());

        Self {
            url: format!("{}?app_id={}", DEFAULT_WS_URL, DEFAULT_APP_ID),
            token: None,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_reconnects: 10,
            channel_capacity: 256,
            symbol_map,
        }
    }
}

impl FeedConfig {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("TICKFLOW_WS_URL") {
            config.url = url;
        } else if let Ok(app_id) = env::var("TICKFLOW_APP_ID") {
            config.url = format!("{}?app_id={}", DEFAULT_WS_URL, app_id);
        }
        if let Ok(token) = env::var("TICKFLOW_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }
        config
    }

    /// Translate an operator-facing name into the provider symbol.
    /// Unknown names pass through unchanged; the provider decides whether
    /// they exist.
    pub fn resolve_symbol(&self, name: &str) -> String {
        self.symbol_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Configuration for the crossover strategy.
#[derive(Debug, Clone, Copy)]
pub struct StrategyConfig {
    pub fast_period: usize,
    pub slow_period: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fast_period: 5,
            slow_period: 20,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fast_period == 0 || self.slow_period == 0 {
            return Err(SignalError::InvalidConfig(
                "moving-average periods must be positive".to_string(),
            ));
        }
        if self.fast_period >= self.slow_period {
            return Err(SignalError::InvalidConfig(format!(
                "fast period {} must be less than slow period {}",
                self.fast_period, self.slow_period
            )));
        }
        Ok(())
    }

    /// Minimum buffer length needed to detect a cross: two consecutive slow
    /// averages.
    pub fn min_samples(&self) -> usize {
        self.slow_period + 1
    }
}
