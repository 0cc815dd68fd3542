//! Bounded, time-ordered window of recent price samples for one instrument.

use crate::error::{Result, SignalError};
use crate::models::PriceSample;
use std::collections::VecDeque;

/// Trailing window of samples. Strictly increasing timestamps; once the
/// buffer exceeds capacity the oldest samples are evicted from the front.
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    samples: VecDeque<PriceSample>,
    capacity: usize,
}

impl SeriesBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample. Rejects timestamps at or before the last stored one
    /// and leaves the buffer unchanged; duplicates carry no new information.
    pub fn append(&mut self, sample: PriceSample) -> Result<()> {
        if let Some(last) = self.samples.back() {
            if sample.timestamp <= last.timestamp {
                return Err(SignalError::OutOfOrder {
                    incoming: sample.timestamp,
                    last: last.timestamp,
                });
            }
        }
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        Ok(())
    }

    /// Last `n` samples in arrival order.
    pub fn window(&self, n: usize) -> Result<Vec<PriceSample>> {
        if self.samples.len() < n {
            return Err(SignalError::InsufficientData {
                have: self.samples.len(),
                need: n,
            });
        }
        Ok(self
            .samples
            .iter()
            .skip(self.samples.len() - n)
            .copied()
            .collect())
    }

    /// Copy of the whole buffer, for evaluation outside the lock.
    pub fn snapshot(&self) -> Vec<PriceSample> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&PriceSample> {
        self.samples.back()
    }
}
