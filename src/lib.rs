pub mod config;
pub mod error;
pub mod rpc; // Endpoint pool, socket agents, rate limiting
pub mod testing; // Mock transports for driving failure scenarios
pub mod utils;
pub mod websocket; // Persistent subscriptions with staleness detection

pub use config::{load_config, Config};
pub use error::{BackoffPolicy, ErrorCategory, NetError, Result};
pub use rpc::{EndpointStatus, RateLimiter, RpcManager, RpcManagerConfig};
pub use websocket::{StreamEvent, StreamNotice, SubscriptionManager, SubscriptionTarget};
