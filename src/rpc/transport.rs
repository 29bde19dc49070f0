// src/rpc/transport.rs
//! The transport primitive the endpoint pool is built from.
//!
//! `RpcManager` only ever talks to an endpoint through `RpcTransport`, and only
//! ever builds one through `TransportFactory`, so a hard reset is simply
//! "destroy the old transport, ask the factory for a new one".

use crate::error::{NetError, Result};
use crate::rpc::agent::{AgentConfig, AgentStats, SocketAgent};
use crate::utils::redact_url;
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use solana_client::rpc_request::RpcRequest;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    fn url(&self) -> &str;

    /// One JSON-RPC round trip. Implementations must bound it with a deadline.
    async fn call(&self, request: RpcRequest, params: Value) -> Result<Value>;

    /// Liveness/latency probe used by the health-check loop.
    async fn probe(&self) -> Result<()> {
        self.call(RpcRequest::GetSlot, Value::Null).await.map(|_| ())
    }

    /// Trivial call issued by the keep-warm loop.
    async fn heartbeat(&self) -> Result<()> {
        self.call(RpcRequest::GetHealth, Value::Null).await.map(|_| ())
    }

    fn agent_stats(&self) -> AgentStats {
        AgentStats::default()
    }

    /// Forcibly closes every socket held by this transport.
    fn destroy(&self);
}

pub trait TransportFactory: Send + Sync + 'static {
    type Transport: RpcTransport;

    /// Builds a brand-new transport (and socket agent) bound to `url`.
    fn connect(&self, url: &str) -> Result<Arc<Self::Transport>>;
}

/// JSON-RPC 2.0 over HTTP, one `SocketAgent` per transport.
pub struct HttpRpcTransport {
    url: String,
    agent: SocketAgent,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl HttpRpcTransport {
    pub fn new(url: &str, agent_config: AgentConfig, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            agent: SocketAgent::new(agent_config)?,
            request_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn get_slot(&self) -> Result<u64> {
        let value = self.call(RpcRequest::GetSlot, Value::Null).await?;
        value
            .as_u64()
            .ok_or_else(|| NetError::ParseError(format!("getSlot returned {}", value)))
    }

    pub fn agent(&self) -> &SocketAgent {
        &self.agent
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, request: RpcRequest, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = request.build_request_json(id, params);

        // Request-level deadline, tighter than the agent's own socket timeouts.
        let reply = timeout(self.request_timeout, self.agent.post_json(&self.url, &body))
            .await
            .map_err(|_| {
                NetError::TimeoutError(format!(
                    "{} to {} exceeded {:?} deadline",
                    request,
                    redact_url(&self.url),
                    self.request_timeout
                ))
            })??;

        if let Some(err) = reply.get("error") {
            return Err(NetError::RpcError(format!("{} failed: {}", request, err)));
        }
        debug!("{} #{} ok via {}", request, id, redact_url(&self.url));
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| NetError::ParseError(format!("{} reply has no result", request)))
    }

    fn agent_stats(&self) -> AgentStats {
        self.agent.stats()
    }

    fn destroy(&self) {
        self.agent.destroy();
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    pub agent_config: AgentConfig,
    pub request_timeout: Duration,
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self {
            agent_config: AgentConfig::default(),
            request_timeout: Duration::from_secs(8),
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    type Transport = HttpRpcTransport;

    fn connect(&self, url: &str) -> Result<Arc<HttpRpcTransport>> {
        HttpRpcTransport::new(url, self.agent_config.clone(), self.request_timeout).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_destroyed_transport_rejects_calls() {
        let factory = HttpTransportFactory::default();
        let transport = factory.connect("http://127.0.0.1:9/").unwrap();
        assert_eq!(transport.url(), "http://127.0.0.1:9/");

        transport.destroy();
        let err = transport.probe().await.unwrap_err();
        assert!(matches!(err, NetError::TransportClosed(_)));
    }

    #[tokio::test]
    async fn test_call_times_out_at_request_deadline() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let factory = HttpTransportFactory {
            request_timeout: Duration::from_millis(200),
            ..HttpTransportFactory::default()
        };
        let transport = factory.connect(&url).unwrap();

        let start = tokio::time::Instant::now();
        let err = transport
            .call(RpcRequest::GetSlot, Value::Null)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, NetError::TimeoutError(_)), "got {:?}", err);
        assert!(elapsed >= Duration::from_millis(200), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert_eq!(transport.agent_stats().active, 0);

        server.abort();
    }

    #[test]
    fn test_request_json_shape() {
        let body = RpcRequest::GetSlot.build_request_json(7, Value::Null);
        assert_eq!(body["method"], "getSlot");
        assert_eq!(body["id"], 7);
        assert_eq!(body["jsonrpc"], "2.0");
    }
}
