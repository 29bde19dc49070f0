//! Testing infrastructure
//!
//! In-memory stand-ins for the RPC and streaming transports so the managers
//! can be driven through failure scenarios on a paused clock:
//! - `MockRpcFactory` / `MockRpcTransport` with per-URL probe behavior
//! - `MockStreamFactory` / `MockStreamTransport` with scriptable connect
//!   failures and manual notification injection

use crate::error::{NetError, Result};
use crate::rpc::transport::{RpcTransport, TransportFactory};
use crate::websocket::transport::{
    NotificationListener, RawNotification, StreamTransport, StreamTransportFactory,
    SubscriptionTarget,
};
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use solana_client::rpc_request::RpcRequest;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a mock endpoint answers health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    #[default]
    Ok,
    Fail,
    /// Never answers; only the caller's deadline ends the probe.
    Hang,
}

#[derive(Debug, Default)]
struct MockEndpoint {
    mode: ProbeMode,
    connects: u32,
    heartbeats: u32,
}

/// Hands out `MockRpcTransport`s. Behavior is keyed by URL, so it carries
/// over to the fresh transport built by a hard reset.
#[derive(Debug, Clone, Default)]
pub struct MockRpcFactory {
    endpoints: Arc<Mutex<HashMap<String, MockEndpoint>>>,
}

impl MockRpcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&self, url: &str, mode: ProbeMode) {
        lock(&self.endpoints).entry(url.to_string()).or_default().mode = mode;
    }

    /// Transports built for `url`, the initial one included.
    pub fn connect_count(&self, url: &str) -> u32 {
        lock(&self.endpoints).get(url).map_or(0, |e| e.connects)
    }

    pub fn heartbeat_count(&self, url: &str) -> u32 {
        lock(&self.endpoints).get(url).map_or(0, |e| e.heartbeats)
    }

    fn mode(&self, url: &str) -> ProbeMode {
        lock(&self.endpoints).get(url).map_or(ProbeMode::Ok, |e| e.mode)
    }
}

impl TransportFactory for MockRpcFactory {
    type Transport = MockRpcTransport;

    fn connect(&self, url: &str) -> Result<Arc<MockRpcTransport>> {
        lock(&self.endpoints).entry(url.to_string()).or_default().connects += 1;
        Ok(Arc::new(MockRpcTransport {
            url: url.to_string(),
            factory: self.clone(),
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct MockRpcTransport {
    url: String,
    factory: MockRpcFactory,
    destroyed: AtomicBool,
}

impl MockRpcTransport {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(NetError::TransportClosed(format!("{} destroyed", self.url)));
        }
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for MockRpcTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, request: RpcRequest, _params: Value) -> Result<Value> {
        self.ensure_open()?;
        debug!("mock {} -> {}", request, self.url);
        Ok(json!(1))
    }

    async fn probe(&self) -> Result<()> {
        self.ensure_open()?;
        match self.factory.mode(&self.url) {
            ProbeMode::Ok => Ok(()),
            ProbeMode::Fail => Err(NetError::RpcError(format!("{} probe refused", self.url))),
            ProbeMode::Hang => std::future::pending().await,
        }
    }

    async fn heartbeat(&self) -> Result<()> {
        self.ensure_open()?;
        lock(&self.factory.endpoints)
            .entry(self.url.clone())
            .or_default()
            .heartbeats += 1;
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct StreamFactoryState {
    fail_next: u32,
    always_fail: bool,
    ping_ok: bool,
    connect_times: Vec<Instant>,
    transports: Vec<Arc<MockStreamTransport>>,
}

/// Scriptable streaming endpoint. Every successful `connect` yields a new
/// `MockStreamTransport`; tests push notifications through `latest()`.
#[derive(Clone)]
pub struct MockStreamFactory {
    url: String,
    state: Arc<Mutex<StreamFactoryState>>,
}

impl Default for MockStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStreamFactory {
    pub fn new() -> Self {
        Self {
            url: "wss://mock.stream".to_string(),
            state: Arc::new(Mutex::new(StreamFactoryState {
                ping_ok: true,
                ..StreamFactoryState::default()
            })),
        }
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    pub fn set_always_fail(&self, fail: bool) {
        lock(&self.state).always_fail = fail;
    }

    /// Whether transports created from now on answer `ping`.
    pub fn set_ping_ok(&self, ok: bool) {
        lock(&self.state).ping_ok = ok;
    }

    /// Every connection attempt, failed ones included.
    pub fn connect_times(&self) -> Vec<Instant> {
        lock(&self.state).connect_times.clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connect_times.len()
    }

    /// Transports actually handed out.
    pub fn transport_count(&self) -> usize {
        lock(&self.state).transports.len()
    }

    pub fn latest(&self) -> Option<Arc<MockStreamTransport>> {
        lock(&self.state).transports.last().cloned()
    }
}

#[async_trait]
impl StreamTransportFactory for MockStreamFactory {
    type Transport = MockStreamTransport;

    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Arc<MockStreamTransport>> {
        let mut state = lock(&self.state);
        state.connect_times.push(Instant::now());
        if state.always_fail {
            return Err(NetError::WebSocketError("mock connect refused".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(NetError::WebSocketError("mock connect refused".to_string()));
        }
        let transport = Arc::new(MockStreamTransport::new(state.ping_ok));
        state.transports.push(transport.clone());
        Ok(transport)
    }
}

pub struct MockStreamTransport {
    listeners: Mutex<HashMap<u64, (SubscriptionTarget, NotificationListener)>>,
    next_handle: AtomicU64,
    closed: AtomicBool,
    ping_ok: bool,
    detach_calls: AtomicU64,
}

impl MockStreamTransport {
    fn new(ping_ok: bool) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            ping_ok,
            detach_calls: AtomicU64::new(0),
        }
    }

    /// Delivers a notification to every listener attached for `target`.
    /// Returns whether anything was listening.
    pub fn emit(&self, target: &SubscriptionTarget, slot: u64, value: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        let matching: Vec<NotificationListener> = lock(&self.listeners)
            .values()
            .filter(|(t, _)| t == target)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in &matching {
            listener(RawNotification {
                slot: Some(slot),
                value: value.clone(),
            });
        }
        !matching.is_empty()
    }

    pub fn attached_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn detach_calls(&self) -> u64 {
        self.detach_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for MockStreamTransport {
    async fn attach(&self, target: &SubscriptionTarget, listener: NotificationListener) -> Result<u64> {
        if self.is_closed() {
            return Err(NetError::TransportClosed("mock stream closed".to_string()));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).insert(handle, (target.clone(), listener));
        Ok(handle)
    }

    async fn detach(&self, _target: &SubscriptionTarget, handle: u64) -> Result<()> {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(NetError::TransportClosed("mock stream closed".to_string()));
        }
        lock(&self.listeners).remove(&handle);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.is_closed() || !self.ping_ok {
            return Err(NetError::WebSocketError("no pong".to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.listeners).clear();
    }
}
