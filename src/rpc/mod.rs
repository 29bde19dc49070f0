// src/rpc/mod.rs

pub mod agent;
pub mod manager;
pub mod rate_limiter;
pub mod transport;

pub use agent::{AgentConfig, AgentStats, SocketAgent};
pub use manager::{EndpointStatus, ResetCallback, RpcManager, RpcManagerConfig};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use transport::{HttpRpcTransport, HttpTransportFactory, RpcTransport, TransportFactory};
