// src/rpc/manager.rs
//! Multi-endpoint RPC manager.
//!
//! Provides:
//! - round-robin selection over the currently healthy endpoints (fail open when none are)
//! - a pinned primary connection for stateful consumers
//! - periodic health probes with a hard reset of endpoints that stay degraded
//! - a keep-warm loop holding pooled sockets resident
//! - rate-limited call admission and reset notifications

use crate::error::{NetError, Result};
use crate::rpc::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::rpc::transport::{HttpTransportFactory, RpcTransport, TransportFactory};
use crate::utils::redact_url;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

pub type ResetCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcManagerConfig {
    /// Ordered; the first entry is the primary.
    pub endpoints: Vec<String>,
    pub rate_limit: RateLimiterConfig,
    pub health_check_interval: Duration,
    pub keep_warm_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before an endpoint leaves rotation and becomes reset-eligible.
    pub unhealthy_threshold: u32,
    /// Consecutive failures before socket-pool counters are logged.
    pub escalation_threshold: u32,
    pub reset_cooldown: Duration,
}

impl Default for RpcManagerConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            rate_limit: RateLimiterConfig::default(),
            health_check_interval: Duration::from_secs(10),
            keep_warm_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            escalation_threshold: 2,
            reset_cooldown: Duration::from_secs(30),
        }
    }
}

struct EndpointState<T> {
    transport: Arc<T>,
    healthy: bool,
    latency_ms: i64,
    fail_count: u32,
    last_check: Option<Instant>,
    last_reset: Option<Instant>,
}

/// One upstream provider. Never removed, only reset in place.
pub struct Endpoint<T> {
    url: String,
    redacted_url: String,
    state: RwLock<EndpointState<T>>,
}

impl<T: RpcTransport> Endpoint<T> {
    fn new(url: String, transport: Arc<T>) -> Self {
        Self {
            redacted_url: redact_url(&url),
            url,
            state: RwLock::new(EndpointState {
                transport,
                healthy: true,
                latency_ms: -1,
                fail_count: 0,
                last_check: None,
                last_reset: None,
            }),
        }
    }

    async fn transport(&self) -> Arc<T> {
        self.state.read().await.transport.clone()
    }

    async fn status(&self) -> EndpointStatus {
        let state = self.state.read().await;
        EndpointStatus {
            url: self.redacted_url.clone(),
            healthy: state.healthy,
            latency_ms: state.latency_ms,
            fail_count: state.fail_count,
            last_check_ms_ago: state.last_check.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Operator-facing view of one endpoint. The URL is always redacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStatus {
    pub url: String,
    pub healthy: bool,
    pub latency_ms: i64,
    pub fail_count: u32,
    pub last_check_ms_ago: Option<u64>,
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({}ms, failures: {})",
            self.url,
            if self.healthy { "healthy" } else { "UNHEALTHY" },
            self.latency_ms,
            self.fail_count
        )
    }
}

pub struct RpcManager<F: TransportFactory = HttpTransportFactory> {
    config: RpcManagerConfig,
    factory: F,
    endpoints: Vec<Endpoint<F::Transport>>,
    rate_limiter: RateLimiter,
    round_robin_counter: AtomicUsize,
    reset_callbacks: RwLock<Vec<ResetCallback>>,
    health_tick_guard: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: TransportFactory> RpcManager<F> {
    pub fn new(config: RpcManagerConfig, factory: F) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(NetError::ConfigError(
                "RpcManager needs at least one endpoint".to_string(),
            ));
        }
        config.rate_limit.validate()?;
        if config.health_check_interval.is_zero() || config.keep_warm_interval.is_zero() {
            return Err(NetError::ConfigError(
                "health-check and keep-warm intervals must be non-zero".to_string(),
            ));
        }

        let endpoints = config
            .endpoints
            .iter()
            .map(|url| Ok(Endpoint::new(url.clone(), factory.connect(url)?)))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "🏊 RPC manager created with {} endpoint(s), primary {}",
            endpoints.len(),
            endpoints[0].redacted_url
        );

        Ok(Self {
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            config,
            factory,
            endpoints,
            round_robin_counter: AtomicUsize::new(0),
            reset_callbacks: RwLock::new(Vec::new()),
            health_tick_guard: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Transport for the next call, round robin over healthy endpoints.
    ///
    /// Fails open: with no healthy endpoint the primary is returned anyway so
    /// the caller's own request surfaces the real failure.
    pub async fn connection(&self) -> Arc<F::Transport> {
        let mut healthy = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let state = endpoint.state.read().await;
            if state.healthy {
                healthy.push(state.transport.clone());
            }
        }

        if healthy.is_empty() {
            warn!(
                "⚠️ All {} RPC endpoints unhealthy, failing open to primary {}",
                self.endpoints.len(),
                self.endpoints[0].redacted_url
            );
            return self.endpoints[0].transport().await;
        }

        let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        healthy.swap_remove(idx)
    }

    /// Always the first configured endpoint, regardless of health.
    pub async fn primary_connection(&self) -> Arc<F::Transport> {
        self.endpoints[0].transport().await
    }

    /// Connection for streaming consumers; pinned like the primary.
    pub async fn stream_connection(&self) -> Arc<F::Transport> {
        self.primary_connection().await
    }

    pub async fn acquire_rate(&self, count: u32) {
        self.rate_limiter.acquire(count).await;
    }

    pub async fn on_connection_reset<C>(&self, callback: C)
    where
        C: Fn() + Send + Sync + 'static,
    {
        self.reset_callbacks.write().await.push(Arc::new(callback));
    }

    pub async fn get_status(&self) -> Vec<EndpointStatus> {
        let mut statuses = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            statuses.push(endpoint.status().await);
        }
        statuses
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub async fn healthy_count(&self) -> usize {
        let mut count = 0;
        for endpoint in &self.endpoints {
            if endpoint.state.read().await.healthy {
                count += 1;
            }
        }
        count
    }

    pub fn config(&self) -> &RpcManagerConfig {
        &self.config
    }

    /// Runs one health-check pass over every endpoint.
    ///
    /// Returns `false` without doing anything if the previous pass is still running.
    pub async fn check_health(&self) -> bool {
        let _guard = match self.health_tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Health check still running, skipping tick");
                return false;
            }
        };

        join_all(self.endpoints.iter().map(|ep| self.check_endpoint(ep))).await;
        true
    }

    async fn check_endpoint(&self, endpoint: &Endpoint<F::Transport>) {
        let transport = endpoint.transport().await;
        let start = Instant::now();
        let outcome = match timeout(self.config.probe_timeout, transport.probe()).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NetError::TimeoutError(format!(
                "probe exceeded {:?}",
                self.config.probe_timeout
            ))),
        };

        let now = Instant::now();
        let reset = {
            let mut state = endpoint.state.write().await;
            state.last_check = Some(now);

            match outcome {
                Ok(rtt) => {
                    if !state.healthy {
                        info!("✅ Endpoint {} is healthy again", endpoint.redacted_url);
                    }
                    state.healthy = true;
                    state.fail_count = 0;
                    state.latency_ms = rtt.as_millis() as i64;
                    debug!(
                        "Health check passed for {} ({}ms)",
                        endpoint.redacted_url, state.latency_ms
                    );
                    false
                }
                Err(e) => {
                    state.fail_count += 1;
                    state.latency_ms = -1;

                    if state.fail_count >= self.config.escalation_threshold {
                        error!(
                            "❌ Endpoint {} failed {} consecutive probes: {} [sockets: {}]",
                            endpoint.redacted_url,
                            state.fail_count,
                            e,
                            transport.agent_stats()
                        );
                    } else {
                        warn!("Health check failed for {}: {}", endpoint.redacted_url, e);
                    }

                    if state.fail_count >= self.config.unhealthy_threshold && state.healthy {
                        state.healthy = false;
                        warn!(
                            "🚫 Endpoint {} marked unhealthy, removed from rotation",
                            endpoint.redacted_url
                        );
                    }

                    let cooled_down = state
                        .last_reset
                        .map_or(true, |t| now.duration_since(t) >= self.config.reset_cooldown);

                    state.fail_count >= self.config.unhealthy_threshold
                        && cooled_down
                        && self.hard_reset(endpoint, &mut state, now)
                }
            }
        };

        if reset {
            let callbacks = self.reset_callbacks.read().await.clone();
            for callback in callbacks {
                callback();
            }
        }
    }

    /// Replaces the endpoint's agent and transport. Returns whether a fresh
    /// transport is now in place.
    fn hard_reset(
        &self,
        endpoint: &Endpoint<F::Transport>,
        state: &mut EndpointState<F::Transport>,
        now: Instant,
    ) -> bool {
        warn!(
            "🔄 Hard reset of {} after {} failures [sockets: {}]",
            endpoint.redacted_url,
            state.fail_count,
            state.transport.agent_stats()
        );
        state.transport.destroy();
        state.fail_count = 0;
        state.last_reset = Some(now);
        state.healthy = false;

        match self.factory.connect(&endpoint.url) {
            Ok(fresh) => {
                state.transport = fresh;
                true
            }
            Err(e) => {
                error!(
                    "❌ Could not rebuild transport for {}: {}",
                    endpoint.redacted_url, e
                );
                false
            }
        }
    }

    /// Fires one trivial call per endpoint without waiting on the replies.
    pub async fn keep_warm(&self) {
        for endpoint in &self.endpoints {
            let transport = endpoint.transport().await;
            let url = endpoint.redacted_url.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.heartbeat().await {
                    debug!("Keep-warm call to {} failed: {}", url, e);
                }
            });
        }
    }

    /// Starts the health-check loop and the independent keep-warm loop.
    pub async fn start_health_checks(self: &Arc<Self>, check_interval: Duration) {
        if check_interval.is_zero() {
            error!("❌ Refusing to start health checks with a zero interval");
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Health checks already running");
            return;
        }

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let manager = Arc::clone(&manager);
                // Detached so a slow pass cannot delay the ticker; overlap is
                // handled by the tick guard.
                tokio::spawn(async move {
                    manager.check_health().await;
                });
            }
        }));

        let manager = Arc::clone(self);
        let warm_every = self.config.keep_warm_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(warm_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.keep_warm().await;
            }
        }));

        info!(
            "🩺 RPC health checks every {:?}, keep-warm every {:?}",
            check_interval, warm_every
        );
    }

    pub async fn stop_health_checks(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("🛑 RPC health checks stopped");
    }
}
