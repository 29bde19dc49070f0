// src/websocket/mod.rs

pub mod client; // tokio-tungstenite pubsub transport
pub mod manager; // Persistent subscriptions, heartbeat and reconnect-all
pub mod transport; // Streaming transport traits and subscription targets

pub use client::{WsStreamTransport, WsTransportFactory};
pub use manager::{
    AlertCallback, EventCallback, StreamNotice, SubscriptionManager, SubscriptionManagerConfig,
};
pub use transport::{
    NotificationListener, RawNotification, StreamEvent, StreamTransport, StreamTransportFactory,
    SubscriptionTarget,
};
