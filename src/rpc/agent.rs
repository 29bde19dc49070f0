// src/rpc/agent.rs
//! Socket agent: one pooled HTTP client per endpoint with aggressive timeouts.
//!
//! - idle sockets are dropped after `idle_timeout`
//! - a request with no response within `active_timeout` is killed with its socket
//! - the whole pool is recycled every `socket_ttl`, healthy or not
//! - `destroy()` aborts every in-flight request immediately

use crate::error::{NetError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub idle_timeout: Duration,
    pub active_timeout: Duration,
    pub socket_ttl: Duration,
    pub connect_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            active_timeout: Duration::from_secs(10),
            socket_ttl: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            max_idle_per_host: 16,
        }
    }
}

/// Socket-pool counters, logged when an endpoint keeps failing so that a dead
/// provider can be told apart from an exhausted or poisoned local pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub created: u64,
    pub active: u64,
    pub free: u64,
    pub timed_out: u64,
    pub closed: u64,
}

impl std::fmt::Display for AgentStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} active={} free={} timed_out={} closed={}",
            self.created, self.active, self.free, self.timed_out, self.closed
        )
    }
}

#[derive(Debug, Default)]
struct AgentCounters {
    created: AtomicU64,
    active: AtomicU64,
    timed_out: AtomicU64,
    closed: AtomicU64,
}

struct PoolGeneration {
    client: reqwest::Client,
    born: Instant,
}

/// Decrements the in-flight counter however the request ends.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct SocketAgent {
    config: AgentConfig,
    pool: Mutex<PoolGeneration>,
    counters: AgentCounters,
    destroyed: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl SocketAgent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let client = Self::build_client(&config)?;
        let counters = AgentCounters::default();
        counters.created.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Ok(Self {
            config,
            pool: Mutex::new(PoolGeneration {
                client,
                born: Instant::now(),
            }),
            counters,
            destroyed: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        })
    }

    fn build_client(config: &AgentConfig) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .timeout(config.active_timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .tcp_nodelay(true)
            .build()
            .map_err(NetError::from)
    }

    /// Hands out the live pool, swapping in a fresh one once the current pool
    /// has outlived its TTL. The retired pool closes with its last request.
    async fn client(&self) -> Result<reqwest::Client> {
        if self.is_destroyed() {
            return Err(NetError::TransportClosed("socket agent destroyed".to_string()));
        }

        let mut pool = self.pool.lock().await;
        if pool.born.elapsed() >= self.config.socket_ttl {
            *pool = PoolGeneration {
                client: Self::build_client(&self.config)?,
                born: Instant::now(),
            };
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            debug!("♻️ Socket pool recycled after {:?} TTL", self.config.socket_ttl);
        }
        Ok(pool.client.clone())
    }

    /// POSTs a JSON body and decodes the JSON reply.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let client = self.client().await?;
        let _in_flight = InFlight::enter(&self.counters.active);
        let mut cancel = self.cancel_rx.clone();

        let request = async {
            let response = client.post(url).json(body).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(NetError::RpcError(format!("HTTP {}", status)));
            }
            response.json::<Value>().await.map_err(NetError::from)
        };

        tokio::select! {
            result = request => {
                if matches!(&result, Err(e) if e.is_timeout()) {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            _ = cancel.wait_for(|destroyed| *destroyed) => {
                Err(NetError::TransportClosed("request aborted by agent destroy".to_string()))
            }
        }
    }

    /// Kills the agent: in-flight requests are aborted (dropping their sockets)
    /// and every later request fails fast.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel_tx.send(true);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        info!(
            "💥 Socket agent destroyed ({} request(s) aborted)",
            self.counters.active.load(Ordering::Relaxed)
        );
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AgentStats {
        let active = self.counters.active.load(Ordering::Relaxed);
        AgentStats {
            created: self.counters.created.load(Ordering::Relaxed),
            active,
            free: u64::from(!self.is_destroyed() && active == 0),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_destroyed_agent_fails_fast() {
        let agent = SocketAgent::new(AgentConfig::default()).unwrap();
        assert_eq!(agent.stats().created, 1);
        assert_eq!(agent.stats().free, 1);

        agent.destroy();
        agent.destroy(); // idempotent

        let err = agent
            .post_json("http://127.0.0.1:9/", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::TransportClosed(_)));

        let stats = agent.stats();
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.free, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_destroy_aborts_in_flight_request() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let agent = Arc::new(SocketAgent::new(AgentConfig::default()).unwrap());
        let in_flight = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.post_json(&url, &json!({"method": "getSlot"})).await })
        };

        for _ in 0..100 {
            if agent.stats().active == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(agent.stats().active, 1);

        agent.destroy();
        let result = tokio::time::timeout(Duration::from_secs(2), in_flight)
            .await
            .expect("request should end promptly after destroy")
            .unwrap();
        assert!(matches!(result, Err(NetError::TransportClosed(_))), "got {:?}", result);
        assert_eq!(agent.stats().active, 0);

        server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_recycled_after_ttl() {
        let config = AgentConfig {
            socket_ttl: Duration::from_secs(60),
            ..AgentConfig::default()
        };
        let agent = SocketAgent::new(config).unwrap();

        agent.client().await.unwrap();
        assert_eq!(agent.stats().created, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        agent.client().await.unwrap();
        let stats = agent.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.closed, 1);
    }
}
