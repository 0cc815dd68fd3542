//! WebSocket feed client: one persistent connection shared by all
//! subscriptions, with reconnect handling owned by a background task.

use crate::config::FeedConfig;
use crate::error::{Result, SignalError};
use crate::feed::messages::{RequestMessage, ServerMessage, TickPayload};
use crate::models::{FeedEvent, GapReason, Instrument, PriceSample};
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Live subscription to one instrument's sample stream.
///
/// Yields an infinite sequence of events; once the subscription is cancelled
/// or the feed fails permanently, `next_event` returns `None` forever.
/// Dropping the subscription cancels it: when the last receiver for an
/// instrument is gone the client retires the route and tells the provider to
/// forget the stream.
#[derive(Debug)]
pub struct FeedSubscription {
    instrument: Instrument,
    rx: Option<broadcast::Receiver<FeedEvent>>,
    wake: Option<Arc<Notify>>,
}

impl FeedSubscription {
    pub fn new(instrument: Instrument, rx: broadcast::Receiver<FeedEvent>) -> Self {
        Self {
            instrument,
            rx: Some(rx),
            wake: None,
        }
    }

    fn attached(
        instrument: Instrument,
        rx: broadcast::Receiver<FeedEvent>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            instrument,
            rx: Some(rx),
            wake: Some(wake),
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Next sample or gap marker. A lagged consumer observes the loss as a
    /// gap rather than receiving stale data.
    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        match self.rx.as_mut()?.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Some(FeedEvent::Gap(GapReason::Lagged(n)))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        // Release the receiver before waking the connection task so the
        // sweep sees an accurate receiver count.
        self.rx = None;
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }
}

/// Seam between the signal service and the transport, so tests can inject a
/// scripted feed.
#[async_trait::async_trait]
pub trait PriceFeed: Send + Sync {
    async fn subscribe(
        &self,
        instrument: &Instrument,
        deadline: Duration,
    ) -> Result<FeedSubscription>;

    async fn unsubscribe(&self, instrument: &Instrument) -> Result<()>;
}

struct Route {
    /// Resolved provider symbol; several instruments may share one.
    symbol: String,
    sender: broadcast::Sender<FeedEvent>,
    /// Provider-assigned subscription id, learned from the first tick.
    sub_id: Option<String>,
}

type Routes = HashMap<Instrument, Route>;
type PendingAcks = HashMap<String, Vec<oneshot::Sender<Result<()>>>>;

struct Shared {
    config: FeedConfig,
    routes: RwLock<Routes>,
    pending: Mutex<PendingAcks>,
    /// Replaced when the connection task is respawned after a permanent
    /// failure.
    outbound_tx: RwLock<mpsc::Sender<String>>,
    connected_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    failed: AtomicBool,
}

/// Removes one instrument's route. Returns the encoded `forget` request when
/// no other route still references the provider symbol.
fn retire_route(routes: &mut Routes, instrument: &Instrument) -> Option<String> {
    let route = routes.remove(instrument)?;
    if routes.values().any(|r| r.symbol == route.symbol) {
        return None;
    }
    let id = route.sub_id?;
    serde_json::to_string(&RequestMessage::Forget { forget: id }).ok()
}

/// Client for a Deriv-style tick provider. Construction spawns the
/// connection task; the task reconnects with bounded exponential backoff and
/// pushes gap markers to subscribers after every resume.
pub struct FeedClient {
    shared: Arc<Shared>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (connected_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            routes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            outbound_tx: RwLock::new(outbound_tx),
            connected_tx,
            shutdown_tx,
            wake: Arc::new(Notify::new()),
            failed: AtomicBool::new(false),
        });

        Self::spawn_connection(&shared, outbound_rx);
        Arc::new(Self { shared })
    }

    fn spawn_connection(shared: &Arc<Shared>, outbound_rx: mpsc::Receiver<String>) {
        let task = ConnectionTask {
            shared: shared.clone(),
            outbound_rx,
            shutdown_rx: shared.shutdown_tx.subscribe(),
        };
        tokio::spawn(task.run());
    }

    /// Wait for the initial connection. Returns false if the deadline lapses
    /// first; subscriptions made before the connection is up will fail.
    pub async fn wait_for_connection(&self, deadline: Duration) -> bool {
        let mut rx = self.shared.connected_tx.subscribe();
        timeout(deadline, rx.wait_for(|connected| *connected))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub async fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Stop the connection task and release the transport. All
    /// subscriptions observe end-of-stream.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.wake.notify_one();
    }

    /// After a permanent failure the next subscribe attempt redials instead
    /// of erroring forever: re-subscription is the recovery path.
    async fn restart_after_failure(&self) {
        if self
            .shared
            .failed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("restarting feed connection task after permanent failure");
            let (outbound_tx, outbound_rx) = mpsc::channel(64);
            *self.shared.outbound_tx.write().await = outbound_tx;
            Self::spawn_connection(&self.shared, outbound_rx);
        }
    }

    async fn subscribe_inner(
        &self,
        instrument: &Instrument,
        deadline: Duration,
    ) -> Result<FeedSubscription> {
        if self.shared.failed.load(Ordering::SeqCst) {
            self.restart_after_failure().await;
        }

        let symbol = self.shared.config.resolve_symbol(&instrument.symbol);

        // An instrument already routed just gets another receiver on the
        // same channel.
        {
            let routes = self.shared.routes.read().await;
            if let Some(route) = routes.get(instrument) {
                return Ok(FeedSubscription::attached(
                    instrument.clone(),
                    route.sender.subscribe(),
                    self.shared.wake.clone(),
                ));
            }
        }

        let (tx, rx) = broadcast::channel(self.shared.config.channel_capacity);
        {
            let mut routes = self.shared.routes.write().await;
            routes.insert(
                instrument.clone(),
                Route {
                    symbol: symbol.clone(),
                    sender: tx,
                    sub_id: None,
                },
            );
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            pending.entry(symbol.clone()).or_default().push(ack_tx);
        }
        self.shared.wake.notify_one();

        // A duplicate request for an already-streaming symbol draws an
        // "AlreadySubscribed" reply, which the connection task treats as an
        // ack just like a tick.
        let request = serde_json::to_string(&RequestMessage::subscribe_ticks(&symbol))
            .map_err(|e| SignalError::Connection(format!("request encoding failed: {}", e)))?;
        let outbound = self.shared.outbound_tx.read().await.clone();
        if outbound.send(request).await.is_err() {
            self.rollback(instrument, &symbol).await;
            return Err(SignalError::Connection(
                "feed connection task is not running".to_string(),
            ));
        }

        let acked = timeout(deadline, ack_rx).await;
        match acked {
            // The receiver was created before the request went out, so the
            // first tick is delivered to the subscription as well as acking it.
            Ok(Ok(Ok(()))) => Ok(FeedSubscription::attached(
                instrument.clone(),
                rx,
                self.shared.wake.clone(),
            )),
            Ok(Ok(Err(e))) => {
                self.rollback(instrument, &symbol).await;
                Err(e)
            }
            Ok(Err(_)) => {
                self.rollback(instrument, &symbol).await;
                Err(SignalError::Connection(
                    "feed connection task stopped".to_string(),
                ))
            }
            Err(_) => {
                self.rollback(instrument, &symbol).await;
                if *self.shared.connected_tx.borrow() {
                    Err(SignalError::Timeout(deadline))
                } else {
                    Err(SignalError::Connection(
                        "provider unreachable".to_string(),
                    ))
                }
            }
        }
    }

    async fn rollback(&self, instrument: &Instrument, symbol: &str) {
        self.shared.routes.write().await.remove(instrument);
        // Other subscribers may still be waiting on the same symbol; only
        // drop waiters whose receiver side is gone.
        let mut pending = self.shared.pending.lock().await;
        if let Some(waiters) = pending.get_mut(symbol) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                pending.remove(symbol);
            }
        }
    }
}

#[async_trait::async_trait]
impl PriceFeed for FeedClient {
    async fn subscribe(
        &self,
        instrument: &Instrument,
        deadline: Duration,
    ) -> Result<FeedSubscription> {
        self.subscribe_inner(instrument, deadline).await
    }

    async fn unsubscribe(&self, instrument: &Instrument) -> Result<()> {
        let forget = {
            let mut routes = self.shared.routes.write().await;
            if !routes.contains_key(instrument) {
                return Err(SignalError::NotSubscribed(instrument.to_string()));
            }
            retire_route(&mut routes, instrument)
        };

        // Forget only fires when no other instrument shares the provider
        // symbol; best effort either way, since the route is already gone
        // and ticks stop flowing to the subscriber.
        if let Some(request) = forget {
            let _ = self.shared.outbound_tx.read().await.try_send(request);
        }
        self.shared.wake.notify_one();
        info!(instrument = %instrument, "unsubscribed");
        Ok(())
    }
}

struct ConnectionTask {
    shared: Arc<Shared>,
    outbound_rx: mpsc::Receiver<String>,
    shutdown_rx: watch::Receiver<bool>,
}

enum SessionEnd {
    TransportLost,
    Shutdown,
    /// The last subscription was cancelled; the transport was released.
    Idle,
}

impl ConnectionTask {
    async fn run(mut self) {
        if let Err(e) = url::Url::parse(&self.shared.config.url) {
            error!(url = %self.shared.config.url, error = %e, "invalid feed endpoint");
            self.fail_permanently().await;
            return;
        }

        let mut ever_connected = false;
        let mut backoff = self.new_backoff();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match tokio_tungstenite::connect_async(self.shared.config.url.as_str()).await {
                Ok((stream, _)) => {
                    info!(url = %self.shared.config.url, "feed connected");
                    backoff = self.new_backoff();
                    let _ = self.shared.connected_tx.send(true);

                    if ever_connected {
                        self.broadcast_gap(GapReason::Reconnect).await;
                    }
                    ever_connected = true;

                    let end = self.session(stream).await;
                    let _ = self.shared.connected_tx.send(false);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Idle => {
                            if self.park().await {
                                return;
                            }
                            backoff = self.new_backoff();
                            continue;
                        }
                        SessionEnd::TransportLost => {
                            warn!("feed transport lost, scheduling reconnect");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "feed connect attempt failed");
                }
            }

            let Some(delay) = backoff.next() else {
                error!(
                    max = self.shared.config.max_reconnects,
                    "feed reconnect budget exhausted, failing permanently"
                );
                self.fail_permanently().await;
                return;
            };

            debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => break,
            }

            // Every remaining subscription was cancelled or dropped
            // mid-backoff: park instead of retrying, until a new
            // subscription arrives.
            self.sweep_dead_routes().await;
            if ever_connected && self.shared.routes.read().await.is_empty() {
                if self.park().await {
                    return;
                }
                backoff = self.new_backoff();
            }
        }

        self.fail_pending("feed shut down").await;
        info!("feed connection task stopped");
    }

    /// Wait until a new subscription (or shutdown) arrives. Returns true
    /// when the task should exit.
    async fn park(&mut self) -> bool {
        debug!("no active subscriptions, parking reconnect loop");
        loop {
            tokio::select! {
                _ = self.shared.wake.notified() => {}
                _ = self.shutdown_rx.changed() => return true,
            }
            if *self.shutdown_rx.borrow() {
                return true;
            }
            self.sweep_dead_routes().await;
            if !self.shared.routes.read().await.is_empty()
                || !self.shared.pending.lock().await.is_empty()
            {
                return false;
            }
        }
    }

    fn new_backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.shared.config.backoff_min)
            .with_max_delay(self.shared.config.backoff_max)
            .with_max_times(self.shared.config.max_reconnects)
            .with_jitter()
            .build()
    }

    /// Retire routes whose subscriptions were all dropped. Symbols left with
    /// no route get a `forget` queued.
    async fn sweep_dead_routes(&self) {
        let mut routes = self.shared.routes.write().await;
        let dead: Vec<Instrument> = routes
            .iter()
            .filter(|(_, route)| route.sender.receiver_count() == 0)
            .map(|(instrument, _)| instrument.clone())
            .collect();
        if dead.is_empty() {
            return;
        }
        let mut forgets = Vec::new();
        for instrument in dead {
            debug!(instrument = %instrument, "retiring dropped subscription");
            if let Some(request) = retire_route(&mut routes, &instrument) {
                forgets.push(request);
            }
        }
        drop(routes);
        let outbound = self.shared.outbound_tx.read().await;
        for request in forgets {
            let _ = outbound.try_send(request);
        }
    }

    /// One connected session: authorize, replay subscriptions, then pump
    /// messages until the transport drops or shutdown is requested.
    async fn session(
        &mut self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        if let Some(token) = &self.shared.config.token {
            let auth = RequestMessage::Authorize {
                authorize: token.clone(),
            };
            if let Ok(json) = serde_json::to_string(&auth) {
                if write.send(Message::Text(json)).await.is_err() {
                    return SessionEnd::TransportLost;
                }
            }
        }

        // Replay every symbol with an active subscription on this fresh
        // connection, once each no matter how many instruments share it.
        self.sweep_dead_routes().await;
        let mut symbols: Vec<String> = {
            let routes = self.shared.routes.read().await;
            routes.values().map(|route| route.symbol.clone()).collect()
        };
        symbols.sort();
        symbols.dedup();
        for symbol in symbols {
            let request = RequestMessage::subscribe_ticks(&symbol);
            let Ok(json) = serde_json::to_string(&request) else {
                continue;
            };
            if write.send(Message::Text(json)).await.is_err() {
                return SessionEnd::TransportLost;
            }
            debug!(symbol = %symbol, "resubscribed");
        }

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = self.shared.wake.notified() => {
                    // Cancellation of the last subscription releases the
                    // transport instead of keeping an idle connection.
                    self.sweep_dead_routes().await;
                    if self.shared.routes.read().await.is_empty()
                        && self.shared.pending.lock().await.is_empty()
                    {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Idle;
                    }
                }
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                return SessionEnd::TransportLost;
                            }
                        }
                        None => return SessionEnd::Shutdown,
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.process_message(&text).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return SessionEnd::TransportLost;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::TransportLost;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "feed read error");
                            return SessionEnd::TransportLost;
                        }
                    }
                }
            }
        }
    }

    async fn process_message(&self, text: &str) {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, raw = %text, "unparseable feed message, skipping");
                return;
            }
        };

        if let Some(err) = &msg.error {
            let symbol = msg.echoed_symbol().unwrap_or_default().to_string();
            if err.code == "AlreadySubscribed" {
                self.resolve_pending(&symbol, Ok(())).await;
                return;
            }
            warn!(code = %err.code, message = %err.message, symbol = %symbol, "provider error");
            // The provider rejected the symbol; every instrument routed to
            // it is dead.
            self.shared
                .routes
                .write()
                .await
                .retain(|_, route| route.symbol != symbol);
            self.resolve_pending(
                &symbol,
                Err(SignalError::UnknownInstrument(format!(
                    "{}: {}",
                    symbol, err.message
                ))),
            )
            .await;
            return;
        }

        if let Some(tick) = msg.tick {
            self.process_tick(tick).await;
        }
    }

    async fn process_tick(&self, tick: TickPayload) {
        let timestamp = DateTime::from_timestamp(tick.epoch, 0).unwrap_or_else(Utc::now);
        let sample = PriceSample::new(timestamp, tick.quote);

        let mut routes = self.shared.routes.write().await;
        let mut routed = false;
        let mut dead = Vec::new();
        for (instrument, route) in routes
            .iter_mut()
            .filter(|(_, route)| route.symbol == tick.symbol)
        {
            routed = true;
            if route.sub_id.is_none() {
                route.sub_id = tick.id.clone();
            }
            // Send fails only when every receiver is gone.
            if route.sender.send(FeedEvent::Sample(sample)).is_err() {
                dead.push(instrument.clone());
            }
        }
        if !routed {
            debug!(symbol = %tick.symbol, "tick for unrouted symbol, dropping");
            return;
        }
        let mut forgets = Vec::new();
        for instrument in dead {
            debug!(instrument = %instrument, "retiring dropped subscription");
            if let Some(request) = retire_route(&mut routes, &instrument) {
                forgets.push(request);
            }
        }
        drop(routes);
        if !forgets.is_empty() {
            let outbound = self.shared.outbound_tx.read().await;
            for request in forgets {
                let _ = outbound.try_send(request);
            }
        }

        // The first tick doubles as the subscription ack.
        self.resolve_pending(&tick.symbol, Ok(())).await;
    }

    async fn resolve_pending(&self, symbol: &str, result: Result<()>) {
        let mut pending = self.shared.pending.lock().await;
        if let Some(waiters) = pending.remove(symbol) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    async fn broadcast_gap(&self, reason: GapReason) {
        let routes = self.shared.routes.read().await;
        for (instrument, route) in routes.iter() {
            debug!(instrument = %instrument, ?reason, "signaling feed gap");
            let _ = route.sender.send(FeedEvent::Gap(reason));
        }
    }

    async fn fail_permanently(&self) {
        let _ = self.shared.connected_tx.send(false);
        // Dropping every sender closes the subscriber channels; callers must
        // re-subscribe after a permanent failure, which restarts the
        // connection task.
        self.shared.routes.write().await.clear();
        self.fail_pending("reconnect attempts exhausted").await;
        // Flag set last: a subscribe that restarts the client can no longer
        // have its pending ack drained by this dying task.
        self.shared.failed.store(true, Ordering::SeqCst);
    }

    async fn fail_pending(&self, reason: &str) {
        let mut pending = self.shared.pending.lock().await;
        for (_, waiters) in pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SignalError::Connection(reason.to_string())));
            }
        }
    }
}
