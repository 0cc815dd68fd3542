//! Unit tests for the signal service, driven by a scripted in-memory feed

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tickflow::config::StrategyConfig;
use tickflow::feed::{FeedSubscription, PriceFeed};
use tickflow::models::{FeedEvent, GapReason, Instrument, PriceSample, SignalAction, Timeframe};
use tickflow::service::SignalService;
use tickflow::strategy::CrossoverStrategy;
use tickflow::SignalError;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;

const DEADLINE: Duration = Duration::from_secs(1);

/// Feed stub: every subscribe hands out a channel the test pushes events
/// into directly.
#[derive(Default)]
struct ScriptedFeed {
    senders: Mutex<HashMap<String, broadcast::Sender<FeedEvent>>>,
    reject_symbol: Option<String>,
    /// Report the route as already gone on unsubscribe, as happens when a
    /// dropped subscription was swept before the explicit call.
    route_already_retired: bool,
}

impl ScriptedFeed {
    async fn push(&self, symbol: &str, event: FeedEvent) {
        let senders = self.senders.lock().await;
        senders
            .get(symbol)
            .expect("symbol not subscribed")
            .send(event)
            .expect("no receiver");
    }

    /// Close the channel, simulating a permanently failed feed.
    async fn kill(&self, symbol: &str) {
        self.senders.lock().await.remove(symbol);
    }
}

#[async_trait]
impl PriceFeed for ScriptedFeed {
    async fn subscribe(
        &self,
        instrument: &Instrument,
        _deadline: Duration,
    ) -> Result<FeedSubscription, SignalError> {
        if self.reject_symbol.as_deref() == Some(instrument.symbol.as_str()) {
            return Err(SignalError::UnknownInstrument(instrument.symbol.clone()));
        }
        let (tx, rx) = broadcast::channel(64);
        self.senders
            .lock()
            .await
            .insert(instrument.symbol.clone(), tx);
        Ok(FeedSubscription::new(instrument.clone(), rx))
    }

    async fn unsubscribe(&self, instrument: &Instrument) -> Result<(), SignalError> {
        self.senders.lock().await.remove(&instrument.symbol);
        if self.route_already_retired {
            return Err(SignalError::NotSubscribed(instrument.to_string()));
        }
        Ok(())
    }
}

/// Feed stub whose subscribe never completes, for timeout behavior.
struct StalledFeed;

#[async_trait]
impl PriceFeed for StalledFeed {
    async fn subscribe(
        &self,
        _instrument: &Instrument,
        _deadline: Duration,
    ) -> Result<FeedSubscription, SignalError> {
        std::future::pending().await
    }

    async fn unsubscribe(&self, _instrument: &Instrument) -> Result<(), SignalError> {
        Ok(())
    }
}

fn instrument(symbol: &str) -> Instrument {
    Instrument::new(symbol, Timeframe::from_secs(60))
}

fn sample(epoch: i64, price: f64) -> FeedEvent {
    FeedEvent::Sample(PriceSample::new(
        Utc.timestamp_opt(epoch, 0).unwrap(),
        price,
    ))
}

fn service_with(feed: Arc<dyn PriceFeed>) -> SignalService {
    let strategy = CrossoverStrategy::new(StrategyConfig {
        fast_period: 3,
        slow_period: 5,
    })
    .unwrap();
    SignalService::new(feed, strategy)
}

/// Writer tasks drain events asynchronously; retry until the assertion
/// passes or the deadline lapses.
async fn eventually<F, Fut, T>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn get_signal_on_unsubscribed_instrument_fails() {
    let service = service_with(Arc::new(ScriptedFeed::default()));
    let err = service
        .get_signal(&instrument("frxEURUSD"), DEADLINE)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::NotSubscribed(_)));
}

#[tokio::test]
async fn subscribe_rejects_unknown_symbol() {
    let feed = Arc::new(ScriptedFeed {
        reject_symbol: Some("frxBOGUS".to_string()),
        ..Default::default()
    });
    let service = service_with(feed);
    let err = service
        .subscribe(&instrument("frxBOGUS"), DEADLINE)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::UnknownInstrument(_)));

    // Failed subscribe leaves no state behind.
    let err = service
        .get_signal(&instrument("frxBOGUS"), DEADLINE)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::NotSubscribed(_)));
}

#[tokio::test]
async fn ticks_flow_into_a_buy_signal() {
    let feed = Arc::new(ScriptedFeed::default());
    let service = service_with(feed.clone());
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();

    // Flat then spike: upward cross on the last tick.
    for (i, price) in [10.0, 10.0, 10.0, 10.0, 10.0, 40.0].iter().enumerate() {
        feed.push("frxEURUSD", sample(i as i64, *price)).await;
    }

    let signal = eventually(|| async {
        service.get_signal(&inst, DEADLINE).await.ok()
    })
    .await;
    assert_eq!(signal.action, SignalAction::Buy);
    assert_eq!(signal.price, 40.0);
    assert_eq!(signal.instrument, inst);
}

#[tokio::test]
async fn too_few_ticks_is_insufficient_data() {
    let feed = Arc::new(ScriptedFeed::default());
    let service = service_with(feed.clone());
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();

    for i in 0..3 {
        feed.push("frxEURUSD", sample(i, 10.0)).await;
    }

    // Give the writer a moment to drain, then confirm it still refuses.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = service.get_signal(&inst, DEADLINE).await.unwrap_err();
    assert!(matches!(err, SignalError::InsufficientData { .. }));
}

#[tokio::test]
async fn out_of_order_ticks_are_counted_not_stored() {
    let feed = Arc::new(ScriptedFeed::default());
    let service = service_with(feed.clone());
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();

    feed.push("frxEURUSD", sample(10, 1.0)).await;
    feed.push("frxEURUSD", sample(10, 2.0)).await;
    feed.push("frxEURUSD", sample(5, 3.0)).await;

    let stats = service.stats(&inst).await.unwrap();
    eventually(|| async {
        (stats.rejected() == 2).then_some(())
    })
    .await;
}

#[tokio::test]
async fn gaps_are_counted() {
    let feed = Arc::new(ScriptedFeed::default());
    let service = service_with(feed.clone());
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();

    feed.push("frxEURUSD", FeedEvent::Gap(GapReason::Reconnect))
        .await;
    feed.push("frxEURUSD", FeedEvent::Gap(GapReason::Lagged(7)))
        .await;

    let stats = service.stats(&inst).await.unwrap();
    eventually(|| async { (stats.gaps() == 2).then_some(()) }).await;
}

#[tokio::test]
async fn closed_feed_surfaces_as_connection_error() {
    let feed = Arc::new(ScriptedFeed::default());
    let service = service_with(feed.clone());
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();

    feed.kill("frxEURUSD").await;

    eventually(|| async {
        match service.get_signal(&inst, DEADLINE).await {
            Err(SignalError::Connection(_)) => Some(()),
            _ => None,
        }
    })
    .await;

    // Re-subscribing replaces the dead state.
    service.subscribe(&inst, DEADLINE).await.unwrap();
    let err = service.get_signal(&inst, DEADLINE).await.unwrap_err();
    assert!(matches!(err, SignalError::InsufficientData { .. }));
}

#[tokio::test]
async fn subscribe_honors_caller_deadline() {
    let service = service_with(Arc::new(StalledFeed));
    let inst = instrument("frxEURUSD");

    let err = service
        .subscribe(&inst, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::Timeout(_)));

    // State unchanged after the timeout.
    let err = service.get_signal(&inst, DEADLINE).await.unwrap_err();
    assert!(matches!(err, SignalError::NotSubscribed(_)));
}

#[tokio::test]
async fn unsubscribe_removes_state() {
    let feed = Arc::new(ScriptedFeed::default());
    let service = service_with(feed.clone());
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();
    assert_eq!(service.subscribed().await.len(), 1);

    service.unsubscribe(&inst).await.unwrap();
    assert!(service.subscribed().await.is_empty());

    let err = service.get_signal(&inst, DEADLINE).await.unwrap_err();
    assert!(matches!(err, SignalError::NotSubscribed(_)));
}

#[tokio::test]
async fn unsubscribe_tolerates_already_retired_route() {
    let feed = Arc::new(ScriptedFeed {
        route_already_retired: true,
        ..Default::default()
    });
    let service = service_with(feed);
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();

    service.unsubscribe(&inst).await.unwrap();
    assert!(service.subscribed().await.is_empty());
}

#[tokio::test]
async fn concurrent_reads_during_appends_see_consistent_windows() {
    let feed = Arc::new(ScriptedFeed::default());
    let service = Arc::new(service_with(feed.clone()));
    let inst = instrument("frxEURUSD");
    service.subscribe(&inst, DEADLINE).await.unwrap();

    let writer_feed = feed.clone();
    let writer = tokio::spawn(async move {
        for i in 0..200 {
            writer_feed
                .push("frxEURUSD", sample(i, 10.0 + (i % 7) as f64))
                .await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let reader_service = service.clone();
    let reader_inst = inst.clone();
    let reader = tokio::spawn(async move {
        let mut successes = 0;
        for _ in 0..50 {
            if let Ok(signal) = reader_service.get_signal(&reader_inst, DEADLINE).await {
                // A consistent window always yields finite averages.
                assert!(signal.fast.is_finite());
                assert!(signal.slow.is_finite());
                successes += 1;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        successes
    });

    writer.await.unwrap();
    let successes = reader.await.unwrap();
    assert!(successes > 0, "no read ever succeeded alongside the writer");
}
