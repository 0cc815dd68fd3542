//! Instrument identity: provider symbol plus sampling timeframe.

use crate::error::{Result, SignalError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sampling timeframe, parsed from the shorthand operators write in
/// configuration: `30s`, `1m`, `1h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe(Duration);

impl Timeframe {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (digits, unit) = s.split_at(s.len().saturating_sub(1));
        let value: u64 = digits
            .parse()
            .map_err(|_| SignalError::InvalidConfig(format!("invalid timeframe '{}'", s)))?;
        let secs = match unit {
            "s" => value,
            "m" => value * 60,
            "h" => value * 3600,
            _ => {
                return Err(SignalError::InvalidConfig(format!(
                    "invalid timeframe '{}', use e.g. 30s, 1m, 1h",
                    s
                )))
            }
        };
        if secs == 0 {
            return Err(SignalError::InvalidConfig(format!(
                "timeframe '{}' must be positive",
                s
            )));
        }
        Ok(Self(Duration::from_secs(secs)))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

/// A tradable symbol plus timeframe. Immutable once a subscription or signal
/// request references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}
