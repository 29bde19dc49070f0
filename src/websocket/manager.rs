// src/websocket/manager.rs
//! Persistent subscriptions over one shared streaming connection.
//!
//! Every subscription tracks its own last-activity time. A heartbeat flags the
//! ones that went quiet and tears down and rebuilds the whole connection,
//! since a dead listener cannot be repaired on a live transport. Reconnects
//! back off exponentially and give up with a single critical alert.

use crate::error::{BackoffPolicy, NetError, Result};
use crate::utils::{redact_url, unix_millis};
use crate::websocket::client::WsTransportFactory;
use crate::websocket::transport::{
    NotificationListener, RawNotification, StreamEvent, StreamTransport, StreamTransportFactory,
    SubscriptionTarget,
};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, timeout, Instant, MissedTickBehavior};

pub type EventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;
pub type AlertCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionManagerConfig {
    pub heartbeat_interval: Duration,
    /// Idle time after which a single subscription counts as dead.
    pub stale_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub diagnostics_window: Duration,
    /// Deadline for the ping issued before a forced reconnect.
    pub soft_check_timeout: Duration,
}

impl Default for SubscriptionManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            stale_timeout: Duration::from_secs(90),
            max_reconnect_attempts: 20,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            diagnostics_window: Duration::from_secs(60),
            soft_check_timeout: Duration::from_secs(5),
        }
    }
}

/// Routine, non-paging stream events. Critical ones go to `on_alert` instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StreamNotice {
    Stale {
        subscription_ids: Vec<String>,
        /// Whether the transport still answered a ping (partial vs total death).
        transport_alive: bool,
    },
    Recovered {
        attempts: u32,
        resubscribed: usize,
    },
    ReconnectFailed {
        attempt: u32,
        error: String,
    },
}

impl std::fmt::Display for StreamNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamNotice::Stale {
                subscription_ids,
                transport_alive,
            } => write!(
                f,
                "stale subscription(s) [{}], {}",
                subscription_ids.join(", "),
                if *transport_alive {
                    "transport alive (partial death)"
                } else {
                    "transport unresponsive (total death)"
                }
            ),
            StreamNotice::Recovered {
                attempts,
                resubscribed,
            } => write!(
                f,
                "stream recovered after {} attempt(s), {} subscription(s) re-attached",
                attempts, resubscribed
            ),
            StreamNotice::ReconnectFailed { attempt, error } => {
                write!(f, "reconnect attempt {} failed: {}", attempt, error)
            }
        }
    }
}

struct Subscription {
    id: String,
    target: SubscriptionTarget,
    callback: EventCallback,
    /// (connection generation, provider handle) while attached.
    handle: Mutex<Option<(u64, u64)>>,
    /// Milliseconds since the manager's epoch.
    last_activity_ms: AtomicU64,
    message_count: AtomicU64,
    active: AtomicBool,
}

impl Subscription {
    fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::SeqCst);
    }
}

struct Connection<T> {
    generation: u64,
    transport: Arc<T>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            transport: Arc::clone(&self.transport),
        }
    }
}

pub struct SubscriptionManager<F: StreamTransportFactory = WsTransportFactory> {
    config: SubscriptionManagerConfig,
    factory: F,
    backoff: BackoffPolicy,
    epoch: Instant,
    subscriptions: DashMap<String, Arc<Subscription>>,
    connection: RwLock<Option<Connection<F::Transport>>>,
    next_generation: AtomicU64,
    alert_callbacks: RwLock<Vec<AlertCallback>>,
    notice_tx: broadcast::Sender<StreamNotice>,
    reconnect_attempts: AtomicU32,
    exhausted: AtomicBool,
    heartbeat_guard: Mutex<()>,
    reconnect_guard: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: StreamTransportFactory> SubscriptionManager<F> {
    pub fn new(config: SubscriptionManagerConfig, factory: F) -> Self {
        let (notice_tx, _) = broadcast::channel(64);
        Self {
            backoff: BackoffPolicy::new(
                config.max_reconnect_attempts,
                config.reconnect_base_delay,
                config.reconnect_max_delay,
            ),
            config,
            factory,
            epoch: Instant::now(),
            subscriptions: DashMap::new(),
            connection: RwLock::new(None),
            next_generation: AtomicU64::new(1),
            alert_callbacks: RwLock::new(Vec::new()),
            notice_tx,
            reconnect_attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            heartbeat_guard: Mutex::new(()),
            reconnect_guard: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Opens the streaming connection if there is none and attaches every
    /// subscription not yet attached to it.
    pub async fn connect(&self) -> Result<()> {
        let connection = self.ensure_connection().await?;
        for sub in self.snapshot() {
            self.attach(&sub, &connection).await?;
        }
        Ok(())
    }

    async fn ensure_connection(&self) -> Result<Connection<F::Transport>> {
        if let Some(connection) = self.connection.read().await.as_ref() {
            return Ok(connection.clone());
        }

        let mut slot = self.connection.write().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }
        info!("🔌 Opening stream to {}", redact_url(self.factory.url()));
        let connection = Connection {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            transport: self.factory.connect().await?,
        };
        *slot = Some(connection.clone());
        Ok(connection)
    }

    fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn listener_for(&self, sub: &Arc<Subscription>) -> NotificationListener {
        let sub = Arc::clone(sub);
        let epoch = self.epoch;
        Arc::new(move |raw: RawNotification| {
            if !sub.active.load(Ordering::SeqCst) {
                return;
            }
            // Only this subscription's clock moves.
            sub.touch(epoch.elapsed().as_millis() as u64);
            sub.message_count.fetch_add(1, Ordering::Relaxed);
            (sub.callback)(StreamEvent {
                subscription_id: sub.id.clone(),
                slot: raw.slot,
                payload: raw.value,
                received_at_ms: unix_millis(),
            });
        })
    }

    /// Attaches `sub` to `connection` unless it already is.
    async fn attach(&self, sub: &Arc<Subscription>, connection: &Connection<F::Transport>) -> Result<()> {
        let mut handle = sub.handle.lock().await;
        if matches!(*handle, Some((generation, _)) if generation == connection.generation) {
            return Ok(());
        }
        let provider_handle = connection
            .transport
            .attach(&sub.target, self.listener_for(sub))
            .await?;
        *handle = Some((connection.generation, provider_handle));
        sub.touch(self.now_ms());
        debug!("📡 {} attached to {} (handle {})", sub.id, sub.target, provider_handle);
        Ok(())
    }

    /// Registers a persistent subscription under `id`, replacing any previous
    /// one with the same id.
    ///
    /// The subscription stays tracked even if the attach fails; the next
    /// reconnect picks it up. Once reconnects are exhausted nothing is opened
    /// until `reconnect_now`.
    pub async fn subscribe<C>(&self, id: &str, target: SubscriptionTarget, callback: C) -> Result<()>
    where
        C: Fn(StreamEvent) + Send + Sync + 'static,
    {
        let sub = Arc::new(Subscription {
            id: id.to_string(),
            target,
            callback: Arc::new(callback),
            handle: Mutex::new(None),
            last_activity_ms: AtomicU64::new(self.now_ms()),
            message_count: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });

        if let Some(previous) = self.subscriptions.insert(id.to_string(), Arc::clone(&sub)) {
            debug!("Replacing subscription {}", id);
            self.retire(&previous).await;
        }
        info!("➕ Subscribing {} to {}", id, sub.target);

        // A fresh connection here would leave every older subscription detached.
        if self.is_exhausted() {
            let err = NetError::ReconnectExhausted(self.reconnect_attempts());
            warn!("Subscription {} tracked until the next manual reconnect: {}", id, err);
            return Err(err);
        }

        let connection = self.ensure_connection().await.map_err(|e| {
            warn!("Subscription {} tracked but not attached: {}", id, e);
            e
        })?;
        self.attach(&sub, &connection).await.map_err(|e| {
            warn!("Subscription {} tracked but not attached: {}", id, e);
            e
        })
    }

    /// Drops the subscription. Returns whether `id` was tracked.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        match self.subscriptions.remove(id) {
            Some((_, sub)) => {
                self.retire(&sub).await;
                info!("➖ Unsubscribed {}", id);
                true
            }
            None => false,
        }
    }

    /// Silences a subscription and best-effort detaches it. Detach failures on
    /// a dead transport are expected and only logged at debug.
    async fn retire(&self, sub: &Subscription) {
        sub.active.store(false, Ordering::SeqCst);
        let handle = sub.handle.lock().await.take();
        let connection = self.connection.read().await.clone();

        if let (Some((generation, provider_handle)), Some(connection)) = (handle, connection) {
            if generation == connection.generation {
                if let Err(e) = connection.transport.detach(&sub.target, provider_handle).await {
                    debug!("Ignoring detach error for {}: {}", sub.id, e);
                }
            }
        }
    }

    /// One heartbeat tick. Returns the ids found stale.
    ///
    /// Any stale subscription forces a full reconnect, whatever the ping says.
    pub async fn check_staleness(&self) -> Vec<String> {
        let _guard = match self.heartbeat_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Heartbeat still running, skipping tick");
                return Vec::new();
            }
        };

        let now = self.now_ms();
        let stale_after = self.config.stale_timeout.as_millis() as u64;
        let mut stale: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_activity_ms.load(Ordering::SeqCst)) >= stale_after
            })
            .map(|entry| entry.key().clone())
            .collect();
        stale.sort();

        if stale.is_empty() {
            return stale;
        }
        if self.is_exhausted() {
            debug!("Stale subscriptions {:?} ignored, reconnects exhausted", stale);
            return stale;
        }

        let connection = self.connection.read().await.clone();
        let transport_alive = match connection {
            Some(connection) => matches!(
                timeout(self.config.soft_check_timeout, connection.transport.ping()).await,
                Ok(Ok(()))
            ),
            None => false,
        };

        let notice = StreamNotice::Stale {
            subscription_ids: stale.clone(),
            transport_alive,
        };
        warn!("⚠️ {}; reconnecting all subscriptions", notice);
        self.notify(notice);

        self.reconnect_all().await;
        stale
    }

    /// Tears the connection down and rebuilds it with every subscription
    /// re-attached, backing off between attempts. Returns whether it recovered.
    pub async fn reconnect_all(&self) -> bool {
        let _guard = match self.reconnect_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Reconnect already in progress");
                return false;
            }
        };
        if self.is_exhausted() {
            return false;
        }

        loop {
            let attempt = self.reconnect_attempts.load(Ordering::SeqCst);
            if self.backoff.is_exhausted(attempt) {
                self.exhausted.store(true, Ordering::SeqCst);
                let message = format!(
                    "🚨 CRITICAL: {} - stream to {} is down, manual intervention required",
                    NetError::ReconnectExhausted(attempt),
                    redact_url(self.factory.url())
                );
                error!("{}", message);
                self.alert(&message).await;
                return false;
            }

            sleep(self.backoff.delay_for_attempt(attempt)).await;

            match self.rebuild().await {
                Ok(resubscribed) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    let notice = StreamNotice::Recovered {
                        attempts: attempt + 1,
                        resubscribed,
                    };
                    info!("✅ {}", notice);
                    self.notify(notice);
                    return true;
                }
                Err(e) => {
                    let failed = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let notice = StreamNotice::ReconnectFailed {
                        attempt: failed,
                        error: e.to_string(),
                    };
                    warn!("🔄 {}", notice);
                    self.notify(notice);
                }
            }
        }
    }

    /// One reconnect attempt: old handles are dropped without unsubscribing
    /// and the old transport is closed outright.
    async fn rebuild(&self) -> Result<usize> {
        for sub in self.snapshot() {
            sub.handle.lock().await.take();
        }
        if let Some(old) = self.connection.write().await.take() {
            old.transport.close();
        }

        let connection = Connection {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            transport: self.factory.connect().await?,
        };
        *self.connection.write().await = Some(connection.clone());

        let subs = self.snapshot();
        for sub in &subs {
            self.attach(sub, &connection).await?;
        }
        Ok(subs.len())
    }

    /// Manual intervention after exhaustion: clears the attempt counter and
    /// tries again.
    pub async fn reconnect_now(&self) -> bool {
        info!("🔧 Manual stream reconnect requested");
        self.exhausted.store(false, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.reconnect_all().await
    }

    /// Reports and clears per-subscription message counts.
    pub fn flush_diagnostics(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.message_count.swap(0, Ordering::Relaxed)))
            .collect();
        counts.sort();

        for (id, count) in &counts {
            info!(
                "📊 {}: {} message(s) in the last {:?}",
                id, count, self.config.diagnostics_window
            );
        }
        counts
    }

    pub async fn on_alert<C>(&self, callback: C)
    where
        C: Fn(&str) + Send + Sync + 'static,
    {
        self.alert_callbacks.write().await.push(Arc::new(callback));
    }

    async fn alert(&self, message: &str) {
        let callbacks = self.alert_callbacks.read().await.clone();
        for callback in callbacks {
            callback(message);
        }
    }

    fn notify(&self, notice: StreamNotice) {
        // No receivers is fine.
        let _ = self.notice_tx.send(notice);
    }

    pub fn notices(&self) -> broadcast::Receiver<StreamNotice> {
        self.notice_tx.subscribe()
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SubscriptionManagerConfig {
        &self.config
    }

    /// Starts the staleness heartbeat and the diagnostics window loop.
    pub async fn start_heartbeat(self: &Arc<Self>, every: Duration) {
        if every.is_zero() || self.config.diagnostics_window.is_zero() {
            error!(
                "❌ Refusing to start stream heartbeat: interval {:?}, diagnostics window {:?}",
                every, self.config.diagnostics_window
            );
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Heartbeat already running");
            return;
        }

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.check_staleness().await;
            }
        }));

        let manager = Arc::clone(self);
        let window = self.config.diagnostics_window;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + window, window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.flush_diagnostics();
            }
        }));

        info!(
            "💓 Stream heartbeat every {:?} (stale after {:?})",
            every, self.config.stale_timeout
        );
    }

    pub async fn stop_heartbeat(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("🛑 Stream heartbeat stopped");
    }

    /// Stops the loops and closes the connection. Subscriptions stay tracked.
    pub async fn shutdown(&self) {
        self.stop_heartbeat().await;
        if let Some(connection) = self.connection.write().await.take() {
            connection.transport.close();
        }
    }
}
