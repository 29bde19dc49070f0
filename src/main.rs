// src/main.rs
use log::{error, info, warn};
use solana_resilient_rpc::{
    config::load_config,
    error::NetError,
    rpc::{HttpTransportFactory, RpcManager},
    utils::setup_logging,
    websocket::{SubscriptionManager, SubscriptionTarget, WsTransportFactory},
};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = load_config()?;
    setup_logging(app_config.log_level)?;
    info!("🚀 Solana resilient RPC layer starting...");
    app_config.log_settings();

    // --- RPC endpoint pool ---
    let factory = HttpTransportFactory {
        agent_config: app_config.agent_config(),
        request_timeout: app_config.request_timeout(),
    };
    let rpc_manager = Arc::new(RpcManager::new(app_config.rpc_manager_config(), factory)?);
    rpc_manager
        .on_connection_reset(|| warn!("🔄 RPC transport replaced, cached connections refreshed"))
        .await;
    rpc_manager
        .start_health_checks(rpc_manager.config().health_check_interval)
        .await;

    rpc_manager.acquire_rate(1).await;
    match rpc_manager.primary_connection().await.get_slot().await {
        Ok(slot) => info!("✅ Primary endpoint at slot {}", slot),
        Err(e) => warn!("⚠️ Initial getSlot failed: {}", e),
    }

    // --- Streaming subscriptions ---
    let stream_factory = WsTransportFactory::new(app_config.stream_url()?);
    let subscriptions = Arc::new(SubscriptionManager::new(
        app_config.subscription_manager_config(),
        stream_factory,
    ));
    subscriptions
        .on_alert(|message| error!("📟 ALERT: {}", message))
        .await;

    let mut notices = subscriptions.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            info!("📣 Stream notice: {}", notice);
        }
    });

    for program in &app_config.subscribe_programs {
        let mentions = match Pubkey::from_str(program) {
            Ok(pubkey) => pubkey,
            Err(e) => {
                warn!("Skipping invalid program id {}: {}", program, e);
                continue;
            }
        };
        let id = format!("logs:{}", program);
        let result = subscriptions
            .subscribe(&id, SubscriptionTarget::Logs { mentions }, move |event| {
                info!(
                    "📨 {} slot {:?}: {}",
                    event.subscription_id,
                    event.slot,
                    event.payload["signature"]
                );
            })
            .await;
        if let Err(e) = result {
            warn!("⚠️ {} will attach on the next reconnect: {}", id, e);
        }
    }
    if app_config.subscribe_programs.is_empty() {
        info!("No SUBSCRIBE_PROGRAMS configured, stream heartbeat idle");
    }
    subscriptions
        .start_heartbeat(subscriptions.config().heartbeat_interval)
        .await;

    // --- Periodic status report ---
    let status_manager = rpc_manager.clone();
    let status_every = Duration::from_secs(app_config.status_interval_secs.max(1));
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(status_every);
        loop {
            interval.tick().await;
            let statuses = status_manager.get_status().await;
            info!(
                "📊 RPC status: {}/{} healthy",
                statuses.iter().filter(|s| s.healthy).count(),
                statuses.len()
            );
            for status in statuses {
                info!("   {}", status);
            }
        }
    });

    info!("Press CTRL-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| NetError::ConfigError(format!("cannot listen for ctrl-c: {}", e)))?;
    info!("🛑 Shutting down gracefully...");

    status_task.abort();
    subscriptions.shutdown().await;
    rpc_manager.stop_health_checks().await;
    info!("✅ Shutdown complete");

    Ok(())
}
