use serde_json::Value;
use solana_client::rpc_request::RpcRequest;
use solana_resilient_rpc::rpc::{RpcManager, RpcManagerConfig, RpcTransport};
use solana_resilient_rpc::testing::{MockRpcFactory, ProbeMode};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const A: &str = "https://rpc-a.example.com/?api-key=aaa";
const B: &str = "https://rpc-b.example.com/?api-key=bbb";
const C: &str = "https://rpc-c.example.com/?api-key=ccc";

fn three_endpoints() -> RpcManagerConfig {
    RpcManagerConfig {
        endpoints: vec![A.to_string(), B.to_string(), C.to_string()],
        ..RpcManagerConfig::default()
    }
}

async fn read_urls(manager: &RpcManager<MockRpcFactory>, n: usize) -> Vec<String> {
    let mut urls = Vec::with_capacity(n);
    for _ in 0..n {
        urls.push(manager.connection().await.url().to_string());
    }
    urls
}

#[tokio::test]
async fn failing_endpoint_leaves_and_rejoins_rotation() {
    let factory = MockRpcFactory::new();
    let manager = RpcManager::new(three_endpoints(), factory.clone()).unwrap();
    let resets = Arc::new(AtomicU32::new(0));
    let counter = resets.clone();
    manager
        .on_connection_reset(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    factory.set_mode(B, ProbeMode::Fail);
    for _ in 0..3 {
        manager.check_health().await;
    }

    let status = manager.get_status().await;
    assert!(status[0].healthy);
    assert!(!status[1].healthy);
    assert!(status[2].healthy);
    assert_eq!(status[1].url, "https://rpc-b.example.com/?api-key=***");
    // third failure crossed the threshold with no prior reset
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(factory.connect_count(B), 2);

    let urls = read_urls(&manager, 6).await;
    assert!(urls.iter().all(|u| u == A || u == C), "{:?}", urls);
    for pair in urls.windows(2) {
        assert_ne!(pair[0], pair[1], "rotation must alternate: {:?}", urls);
    }

    factory.set_mode(B, ProbeMode::Ok);
    manager.check_health().await;
    let status = manager.get_status().await;
    assert!(status[1].healthy);
    assert_eq!(status[1].fail_count, 0);
    assert!(status[1].latency_ms >= 0);

    let seen: HashSet<String> = read_urls(&manager, 3).await.into_iter().collect();
    assert_eq!(seen.len(), 3);
    assert!(seen.contains(B));
}

#[tokio::test]
async fn every_window_of_k_reads_covers_all_healthy_endpoints() {
    let factory = MockRpcFactory::new();
    let manager = RpcManager::new(three_endpoints(), factory).unwrap();

    let urls = read_urls(&manager, 30).await;
    for window in urls.windows(3) {
        let distinct: HashSet<&String> = window.iter().collect();
        assert_eq!(distinct.len(), 3, "{:?}", window);
    }
}

#[tokio::test(start_paused = true)]
async fn sustained_outage_resets_at_most_once_per_cooldown() {
    let factory = MockRpcFactory::new();
    let manager = RpcManager::new(three_endpoints(), factory.clone()).unwrap();
    factory.set_mode(A, ProbeMode::Fail);

    // 2 minutes of 10s ticks against a 30s cooldown
    for _ in 0..12 {
        manager.check_health().await;
        tokio::time::advance(Duration::from_secs(10)).await;
    }

    // resets at t=20s, 50s, 80s and 110s
    assert_eq!(factory.connect_count(A), 5);
    assert_eq!(factory.connect_count(B), 1);
    assert_eq!(manager.healthy_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn rate_admission_delays_but_never_drops() {
    let factory = MockRpcFactory::new();
    let mut config = three_endpoints();
    config.rate_limit.capacity = 10;
    config.rate_limit.refill_per_sec = 10.0;
    let manager = Arc::new(RpcManager::new(config, factory).unwrap());

    let start = Instant::now();
    manager.acquire_rate(10).await;
    assert_eq!(start.elapsed(), Duration::ZERO);

    let mut calls = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        calls.push(tokio::spawn(async move {
            manager.acquire_rate(2).await;
            let transport = manager.connection().await;
            transport.call(RpcRequest::GetSlot, Value::Null).await
        }));
    }
    for call in calls {
        assert!(call.await.unwrap().is_ok());
    }
    let elapsed = start.elapsed().as_secs_f64();
    assert!((0.99..=1.05).contains(&elapsed), "elapsed {}", elapsed);
}
