//! Signal request interface: per-instrument buffers fed by writer tasks,
//! queried synchronously for the latest crossover signal.

use crate::buffer::SeriesBuffer;
use crate::error::{Result, SignalError};
use crate::feed::PriceFeed;
use crate::models::{FeedEvent, GapReason, Instrument, Signal};
use crate::strategy::CrossoverStrategy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Counters the writer task maintains per instrument.
#[derive(Debug, Default)]
pub struct FeedStats {
    gaps: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicBool,
}

impl FeedStats {
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

struct InstrumentState {
    buffer: Arc<RwLock<SeriesBuffer>>,
    stats: Arc<FeedStats>,
    writer: tokio::task::JoinHandle<()>,
}

/// Session object owning all per-instrument state. Replaces any notion of a
/// global shared price cache: buffers live here, are written by exactly one
/// task each, and are read through consistent snapshots.
pub struct SignalService {
    feed: Arc<dyn PriceFeed>,
    strategy: CrossoverStrategy,
    instruments: RwLock<HashMap<Instrument, InstrumentState>>,
}

impl SignalService {
    pub fn new(feed: Arc<dyn PriceFeed>, strategy: CrossoverStrategy) -> Self {
        Self {
            feed,
            strategy,
            instruments: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe an instrument and start its writer task. Re-subscribing an
    /// instrument whose feed failed permanently replaces the dead state.
    pub async fn subscribe(&self, instrument: &Instrument, deadline: Duration) -> Result<()> {
        {
            let instruments = self.instruments.read().await;
            if let Some(state) = instruments.get(instrument) {
                if !state.stats.failed() {
                    debug!(instrument = %instrument, "already subscribed");
                    return Ok(());
                }
            }
        }

        let mut subscription = timeout(deadline, self.feed.subscribe(instrument, deadline))
            .await
            .map_err(|_| SignalError::Timeout(deadline))??;

        let capacity = self.strategy.min_samples();
        let buffer = Arc::new(RwLock::new(SeriesBuffer::new(capacity)));
        let stats = Arc::new(FeedStats::default());

        let writer_buffer = buffer.clone();
        let writer_stats = stats.clone();
        let writer_instrument = instrument.clone();
        let writer = tokio::spawn(async move {
            while let Some(event) = subscription.next_event().await {
                match event {
                    FeedEvent::Sample(sample) => {
                        let mut buf = writer_buffer.write().await;
                        if let Err(e) = buf.append(sample) {
                            writer_stats.rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(instrument = %writer_instrument, error = %e, "sample rejected");
                        }
                    }
                    FeedEvent::Gap(reason) => {
                        writer_stats.gaps.fetch_add(1, Ordering::Relaxed);
                        match reason {
                            GapReason::Reconnect => {
                                warn!(instrument = %writer_instrument, "feed gap: reconnect")
                            }
                            GapReason::Lagged(n) => {
                                warn!(instrument = %writer_instrument, dropped = n, "feed gap: consumer lagged")
                            }
                        }
                    }
                }
            }
            // Channel closed: the subscription was cancelled or the feed
            // failed permanently.
            writer_stats.failed.store(true, Ordering::SeqCst);
            debug!(instrument = %writer_instrument, "writer task finished");
        });

        let state = InstrumentState {
            buffer,
            stats,
            writer,
        };
        let mut instruments = self.instruments.write().await;
        if let Some(old) = instruments.insert(instrument.clone(), state) {
            old.writer.abort();
        }
        info!(instrument = %instrument, capacity, "subscribed");
        Ok(())
    }

    /// Compute the latest signal for a subscribed instrument from a
    /// consistent snapshot of its buffer.
    pub async fn get_signal(&self, instrument: &Instrument, deadline: Duration) -> Result<Signal> {
        timeout(deadline, self.get_signal_inner(instrument))
            .await
            .map_err(|_| SignalError::Timeout(deadline))?
    }

    async fn get_signal_inner(&self, instrument: &Instrument) -> Result<Signal> {
        let instruments = self.instruments.read().await;
        let state = instruments
            .get(instrument)
            .ok_or_else(|| SignalError::NotSubscribed(instrument.to_string()))?;

        if state.stats.failed() {
            return Err(SignalError::Connection(format!(
                "feed for {} terminated, re-subscribe required",
                instrument
            )));
        }

        // Snapshot under the read lock; evaluation runs on the copy so a
        // concurrent append never mutates what we are reading.
        let window = {
            let buffer = state.buffer.read().await;
            buffer.window(self.strategy.min_samples())?
        };
        drop(instruments);

        let evaluation = self.strategy.evaluate(&window)?;
        Ok(Signal {
            instrument: instrument.clone(),
            action: evaluation.action,
            timestamp: evaluation.sample.timestamp,
            fast: evaluation.fast,
            slow: evaluation.slow,
            price: evaluation.sample.price,
        })
    }

    /// Cancel the subscription and stop the writer task.
    pub async fn unsubscribe(&self, instrument: &Instrument) -> Result<()> {
        let state = {
            let mut instruments = self.instruments.write().await;
            instruments
                .remove(instrument)
                .ok_or_else(|| SignalError::NotSubscribed(instrument.to_string()))?
        };
        // The feed may already have retired the route if the writer's
        // subscription ended first.
        let result = match self.feed.unsubscribe(instrument).await {
            Ok(()) | Err(SignalError::NotSubscribed(_)) => Ok(()),
            Err(e) => Err(e),
        };
        state.writer.abort();
        result
    }

    /// Gap/rejection counters for a subscribed instrument.
    pub async fn stats(&self, instrument: &Instrument) -> Result<Arc<FeedStats>> {
        let instruments = self.instruments.read().await;
        instruments
            .get(instrument)
            .map(|s| s.stats.clone())
            .ok_or_else(|| SignalError::NotSubscribed(instrument.to_string()))
    }

    /// Instruments currently subscribed.
    pub async fn subscribed(&self) -> Vec<Instrument> {
        self.instruments.read().await.keys().cloned().collect()
    }
}
