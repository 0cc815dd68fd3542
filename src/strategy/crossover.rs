//! Simple moving-average crossover strategy.

use crate::common::math;
use crate::config::StrategyConfig;
use crate::error::{Result, SignalError};
use crate::models::{PriceSample, SignalAction};

/// Result of evaluating one snapshot: the action plus the averages and the
/// sample that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub action: SignalAction,
    pub fast: f64,
    pub slow: f64,
    pub sample: PriceSample,
}

/// Detects the fast average crossing the slow average between the two most
/// recent samples.
#[derive(Debug, Clone, Copy)]
pub struct CrossoverStrategy {
    config: StrategyConfig,
}

impl CrossoverStrategy {
    pub fn new(config: StrategyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> StrategyConfig {
        self.config
    }

    /// Minimum samples needed: two consecutive slow averages.
    pub fn min_samples(&self) -> usize {
        self.config.min_samples()
    }

    /// Evaluate a consistent snapshot of samples, newest last.
    ///
    /// BUY when the fast average was at or below the slow average on the
    /// previous sample and is strictly above it on the latest; SELL on the
    /// symmetric downward cross; HOLD otherwise. Exact equality on the
    /// latest sample is not a cross.
    pub fn evaluate(&self, samples: &[PriceSample]) -> Result<Evaluation> {
        let need = self.min_samples();
        if samples.len() < need {
            return Err(SignalError::InsufficientData {
                have: samples.len(),
                need,
            });
        }

        let prices: Vec<f64> = samples.iter().map(|s| s.price).collect();
        let prev = &prices[..prices.len() - 1];

        let average = |window: &[f64], period: usize| {
            math::sma(window, period).ok_or(SignalError::InsufficientData {
                have: window.len(),
                need,
            })
        };

        // The length check above guarantees all four windows are populated.
        let fast_now = average(&prices, self.config.fast_period)?;
        let slow_now = average(&prices, self.config.slow_period)?;
        let fast_prev = average(prev, self.config.fast_period)?;
        let slow_prev = average(prev, self.config.slow_period)?;

        let action = if fast_prev <= slow_prev && fast_now > slow_now {
            SignalAction::Buy
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        };

        let sample = samples[samples.len() - 1];

        Ok(Evaluation {
            action,
            fast: fast_now,
            slow: slow_now,
            sample,
        })
    }
}
