// src/websocket/transport.rs
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::sync::Arc;

/// What a persistent subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionTarget {
    /// Transaction logs mentioning a program (new pools, swaps).
    Logs { mentions: Pubkey },
    /// Every account owned by a program.
    Program { program_id: Pubkey },
    /// A single account.
    Account { pubkey: Pubkey },
    Slot,
}

impl SubscriptionTarget {
    pub fn subscribe_method(&self) -> &'static str {
        match self {
            SubscriptionTarget::Logs { .. } => "logsSubscribe",
            SubscriptionTarget::Program { .. } => "programSubscribe",
            SubscriptionTarget::Account { .. } => "accountSubscribe",
            SubscriptionTarget::Slot => "slotSubscribe",
        }
    }

    pub fn unsubscribe_method(&self) -> &'static str {
        match self {
            SubscriptionTarget::Logs { .. } => "logsUnsubscribe",
            SubscriptionTarget::Program { .. } => "programUnsubscribe",
            SubscriptionTarget::Account { .. } => "accountUnsubscribe",
            SubscriptionTarget::Slot => "slotUnsubscribe",
        }
    }

    pub fn subscribe_params(&self) -> Value {
        let commitment = CommitmentConfig::processed().commitment;
        match self {
            SubscriptionTarget::Logs { mentions } => json!([
                { "mentions": [mentions.to_string()] },
                { "commitment": commitment }
            ]),
            SubscriptionTarget::Program { program_id } => json!([
                program_id.to_string(),
                { "encoding": "base64", "commitment": commitment }
            ]),
            SubscriptionTarget::Account { pubkey } => json!([
                pubkey.to_string(),
                { "encoding": "base64", "commitment": commitment }
            ]),
            SubscriptionTarget::Slot => json!([]),
        }
    }
}

impl std::fmt::Display for SubscriptionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionTarget::Logs { mentions } => write!(f, "logs:{}", mentions),
            SubscriptionTarget::Program { program_id } => write!(f, "program:{}", program_id),
            SubscriptionTarget::Account { pubkey } => write!(f, "account:{}", pubkey),
            SubscriptionTarget::Slot => write!(f, "slot"),
        }
    }
}

/// A notification as the transport decoded it, before it is tagged with the
/// local subscription id.
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub slot: Option<u64>,
    pub value: Value,
}

/// What a subscriber's callback receives.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub subscription_id: String,
    pub slot: Option<u64>,
    pub payload: Value,
    pub received_at_ms: u64,
}

pub type NotificationListener = Arc<dyn Fn(RawNotification) + Send + Sync>;

/// One live streaming connection. Dropped wholesale on reconnect.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Registers `target` and routes its notifications to `listener`.
    /// Returns the provider's subscription handle.
    async fn attach(&self, target: &SubscriptionTarget, listener: NotificationListener) -> Result<u64>;

    /// Unregisters a handle. May fail on a dead connection; callers swallow that.
    async fn detach(&self, target: &SubscriptionTarget, handle: u64) -> Result<()>;

    /// Cheap round trip proving the connection itself still answers.
    async fn ping(&self) -> Result<()>;

    /// Tears the connection down without any unregistration.
    fn close(&self);
}

#[async_trait]
pub trait StreamTransportFactory: Send + Sync + 'static {
    type Transport: StreamTransport;

    fn url(&self) -> &str;

    async fn connect(&self) -> Result<Arc<Self::Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_subscribe_params() {
        let program = Pubkey::new_unique();
        let target = SubscriptionTarget::Logs { mentions: program };
        assert_eq!(target.subscribe_method(), "logsSubscribe");
        assert_eq!(target.unsubscribe_method(), "logsUnsubscribe");
        let params = target.subscribe_params();
        assert_eq!(params[0]["mentions"][0], program.to_string());
        assert_eq!(params[1]["commitment"], "processed");
        assert_eq!(target.to_string(), format!("logs:{}", program));
    }

    #[test]
    fn test_slot_subscribe_has_no_params() {
        assert_eq!(SubscriptionTarget::Slot.subscribe_params(), json!([]));
        assert_eq!(SubscriptionTarget::Slot.subscribe_method(), "slotSubscribe");
    }
}
