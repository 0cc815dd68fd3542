//! Tickflow signal engine
//!
//! Maintains a long-lived WebSocket connection to the market-data provider
//! and answers periodic signal queries for the configured instruments.
//! Generates signals only; it never places trades.

use dotenvy::dotenv;
use std::env;
use std::sync::Arc;
use tickflow::config::{FeedConfig, StrategyConfig};
use tickflow::feed::FeedClient;
use tickflow::logging;
use tickflow::models::{Instrument, Timeframe};
use tickflow::service::SignalService;
use tickflow::strategy::CrossoverStrategy;
use tokio::signal;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    logging::init_logging();

    let feed_config = FeedConfig::from_env();
    let strategy_config = StrategyConfig::default();
    let strategy = CrossoverStrategy::new(strategy_config)?;

    let timeframe = env::var("TIMEFRAME")
        .ok()
        .map(|s| Timeframe::parse(&s))
        .transpose()?
        .unwrap_or(Timeframe::from_secs(60));

    let symbols: Vec<String> = env::var("SYMBOLS")
        .unwrap_or_else(|_| "EURUSD_OTC".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    tracing::info!(
        environment = %tickflow::config::get_environment(),
        symbols = ?symbols,
        "starting tickflow signal engine"
    );

    let feed = FeedClient::new(feed_config);
    if !feed.wait_for_connection(Duration::from_secs(10)).await {
        tracing::warn!("connection not established yet, subscriptions may fail until it is");
    }

    let service = Arc::new(SignalService::new(feed.clone(), strategy));

    let instruments: Vec<Instrument> = symbols
        .iter()
        .map(|s| Instrument::new(s.clone(), timeframe))
        .collect();

    for instrument in &instruments {
        match service.subscribe(instrument, Duration::from_secs(10)).await {
            Ok(()) => tracing::info!(instrument = %instrument, "subscribed"),
            Err(e) => tracing::error!(instrument = %instrument, error = %e, "subscribe failed"),
        }
    }

    // Query each instrument once per timeframe and log the result.
    let query_service = service.clone();
    let query_instruments = instruments.clone();
    let interval = timeframe.as_duration();
    let query_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for instrument in &query_instruments {
                match query_service
                    .get_signal(instrument, Duration::from_secs(5))
                    .await
                {
                    Ok(signal) => tracing::info!(
                        instrument = %instrument,
                        action = ?signal.action,
                        fast = signal.fast,
                        slow = signal.slow,
                        price = signal.price,
                        "signal"
                    ),
                    Err(e) => tracing::debug!(instrument = %instrument, error = %e, "no signal yet"),
                }
            }
        }
    });

    signal::ctrl_c().await?;
    tracing::info!("shutting down");
    query_task.abort();
    feed.shutdown();

    Ok(())
}
