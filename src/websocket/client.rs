// src/websocket/client.rs
use crate::error::{NetError, Result};
use crate::utils::redact_url;
use crate::websocket::transport::{
    NotificationListener, RawNotification, StreamTransport, StreamTransportFactory,
    SubscriptionTarget,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{stream::StreamExt, SinkExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type Reply = std::result::Result<Value, Value>;

/// An outstanding request. A subscribe carries its listener so the reader can
/// register it before any notification for the new id is routed.
struct Pending {
    reply: oneshot::Sender<Reply>,
    listener: Option<NotificationListener>,
}

/// JSON-RPC pubsub over one websocket connection.
pub struct WsStreamTransport {
    url: String,
    ws_sender: mpsc::Sender<Message>,
    pending: Arc<DashMap<u64, Pending>>,
    listeners: Arc<DashMap<u64, NotificationListener>>,
    pong: Arc<Notify>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    request_timeout: Duration,
    tasks: Vec<AbortHandle>,
}

impl WsStreamTransport {
    pub async fn connect(url: &str, connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        info!("🌐 Connecting to websocket server: {}", redact_url(url));

        let (ws_stream, _) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                NetError::TimeoutError(format!("websocket connect exceeded {:?}", connect_timeout))
            })??;

        let (mut write, mut read) = ws_stream.split();
        let (mpsc_tx, mut mpsc_rx) = mpsc::channel::<Message>(256);
        let pending: Arc<DashMap<u64, Pending>> = Arc::new(DashMap::new());
        let listeners: Arc<DashMap<u64, NotificationListener>> = Arc::new(DashMap::new());
        let pong = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        // Forward messages from our MPSC channel to the websocket sink
        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = mpsc_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    error!("❌ WebSocket write error: {}. Closing connection.", e);
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        let reader_pending = pending.clone();
        let reader_listeners = listeners.clone();
        let reader_pong = pong.clone();
        let reader_closed = closed.clone();
        let reader_tx = mpsc_tx.clone();
        let reader = tokio::spawn(async move {
            debug!("🔄 WebSocket read loop started.");
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        route_message(&text, &reader_pending, &reader_listeners);
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = reader_tx.try_send(Message::Pong(payload));
                    }
                    Ok(Message::Pong(_)) => reader_pong.notify_waiters(),
                    Ok(Message::Close(frame)) => {
                        warn!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every outstanding request.
            reader_pending.clear();
            debug!("🔚 WebSocket read loop finished.");
        });

        Ok(Self {
            url: url.to_string(),
            ws_sender: mpsc_tx,
            pending,
            listeners,
            pong,
            closed,
            next_id: AtomicU64::new(1),
            request_timeout,
            tasks: vec![writer.abort_handle(), reader.abort_handle()],
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with(method, params, None).await
    }

    async fn request_with(
        &self,
        method: &str,
        params: Value,
        listener: Option<NotificationListener>,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(NetError::TransportClosed(format!("{} on closed websocket", method)));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { reply: tx, listener });

        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if self.ws_sender.send(Message::Text(body.to_string())).await.is_err() {
            self.pending.remove(&id);
            return Err(NetError::TransportClosed("websocket writer gone".to_string()));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(NetError::SubscriptionError(format!("{} rejected: {}", method, error))),
            Ok(Err(_)) => Err(NetError::TransportClosed(format!("{} dropped by closing websocket", method))),
            Err(_) => {
                self.pending.remove(&id);
                Err(NetError::TimeoutError(format!("{} exceeded {:?}", method, self.request_timeout)))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Responses go to the waiting request, notifications to the subscription's listener.
fn route_message(
    text: &str,
    pending: &DashMap<u64, Pending>,
    listeners: &DashMap<u64, NotificationListener>,
) {
    let json: Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(_) => {
            debug!("Failed to parse WebSocket message as JSON");
            return;
        }
    };

    if let Some(id) = json.get("id").and_then(Value::as_u64) {
        if let Some((_, request)) = pending.remove(&id) {
            let reply = match json.get("error") {
                Some(error) => Err(error.clone()),
                None => Ok(json.get("result").cloned().unwrap_or(Value::Null)),
            };
            if let (Ok(result), Some(listener)) = (&reply, request.listener) {
                if let Some(handle) = result.as_u64() {
                    listeners.insert(handle, listener);
                }
            }
            let _ = request.reply.send(reply);
        }
        return;
    }

    let params = &json["params"];
    let Some(subscription) = params["subscription"].as_u64() else {
        return;
    };
    // Clone out so the map shard is not locked while user code runs.
    let listener = listeners.get(&subscription).map(|l| l.value().clone());
    match listener {
        Some(listener) => {
            let result = &params["result"];
            let notification = RawNotification {
                slot: result["context"]["slot"]
                    .as_u64()
                    .or_else(|| result["slot"].as_u64()),
                value: result.get("value").cloned().unwrap_or_else(|| result.clone()),
            };
            listener(notification);
        }
        None => debug!("Notification for unknown subscription {}", subscription),
    }
}

#[async_trait]
impl StreamTransport for WsStreamTransport {
    async fn attach(&self, target: &SubscriptionTarget, listener: NotificationListener) -> Result<u64> {
        let reply = self
            .request_with(target.subscribe_method(), target.subscribe_params(), Some(listener))
            .await?;
        let handle = reply.as_u64().ok_or_else(|| {
            NetError::ParseError(format!("{} returned non-numeric id {}", target.subscribe_method(), reply))
        })?;
        debug!("📡 Subscribed to {} (handle {})", target, handle);
        Ok(handle)
    }

    async fn detach(&self, target: &SubscriptionTarget, handle: u64) -> Result<()> {
        self.listeners.remove(&handle);
        self.request(target.unsubscribe_method(), json!([handle]))
            .await
            .map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NetError::TransportClosed("ping on closed websocket".to_string()));
        }
        // Created before sending so an immediate pong is not missed.
        let pong = self.pong.notified();
        self.ws_sender
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|_| NetError::TransportClosed("websocket writer gone".to_string()))?;
        timeout(self.request_timeout, pong)
            .await
            .map_err(|_| NetError::TimeoutError(format!("no pong within {:?}", self.request_timeout)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        self.listeners.clear();
        self.pending.clear();
        debug!("WebSocket to {} closed", redact_url(&self.url));
    }
}

impl Drop for WsStreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    pub url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl WsTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl StreamTransportFactory for WsTransportFactory {
    type Transport = WsStreamTransport;

    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Arc<WsStreamTransport>> {
        WsStreamTransport::connect(&self.url, self.connect_timeout, self.request_timeout)
            .await
            .map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_route_response_to_pending_request() {
        let pending = DashMap::new();
        let listeners: DashMap<u64, NotificationListener> = DashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(3, Pending { reply: tx, listener: None });

        route_message(r#"{"jsonrpc":"2.0","result":42,"id":3}"#, &pending, &listeners);
        assert_eq!(rx.try_recv().unwrap(), Ok(json!(42)));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_route_error_response() {
        let pending = DashMap::new();
        let listeners: DashMap<u64, NotificationListener> = DashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(9, Pending { reply: tx, listener: None });

        route_message(
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params"},"id":9}"#,
            &pending,
            &listeners,
        );
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_subscribe_reply_registers_listener_before_next_frame() {
        let pending = DashMap::new();
        let listeners: DashMap<u64, NotificationListener> = DashMap::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(
            4,
            Pending {
                reply: tx,
                listener: Some(Arc::new(move |_n: RawNotification| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );

        // Reply and first notification back to back, before the caller resumes.
        route_message(r#"{"jsonrpc":"2.0","result":77,"id":4}"#, &pending, &listeners);
        route_message(
            r#"{"jsonrpc":"2.0","method":"logsNotification","params":{"result":{"context":{"slot":1},"value":{}},"subscription":77}}"#,
            &pending,
            &listeners,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap(), Ok(json!(77)));
    }

    #[test]
    fn test_rejected_subscribe_registers_nothing() {
        let pending = DashMap::new();
        let listeners: DashMap<u64, NotificationListener> = DashMap::new();
        let (tx, _rx) = oneshot::channel();
        pending.insert(
            5,
            Pending {
                reply: tx,
                listener: Some(Arc::new(|_n: RawNotification| {})),
            },
        );
        route_message(
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params"},"id":5}"#,
            &pending,
            &listeners,
        );
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_route_notification_to_listener_only() {
        let pending = DashMap::new();
        let listeners: DashMap<u64, NotificationListener> = DashMap::new();
        let seen: Arc<Mutex<Vec<RawNotification>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        listeners.insert(
            24040,
            Arc::new(move |n: RawNotification| sink.lock().unwrap().push(n)),
        );
        let other_hits = Arc::new(AtomicU64::new(0));
        let other = other_hits.clone();
        listeners.insert(
            1,
            Arc::new(move |_n: RawNotification| {
                other.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let msg = r#"{"jsonrpc":"2.0","method":"logsNotification","params":{"result":{"context":{"slot":5208469},"value":{"signature":"5h6x","err":null,"logs":["Program log: init"]}},"subscription":24040}}"#;
        route_message(msg, &pending, &listeners);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].slot, Some(5208469));
        assert_eq!(seen[0].value["signature"], "5h6x");
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_slot_notification_shape() {
        let pending = DashMap::new();
        let listeners: DashMap<u64, NotificationListener> = DashMap::new();
        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        listeners.insert(
            0,
            Arc::new(move |n: RawNotification| {
                sink.store(n.slot.unwrap_or_default(), Ordering::SeqCst);
            }),
        );
        route_message(
            r#"{"jsonrpc":"2.0","method":"slotNotification","params":{"result":{"parent":75,"root":44,"slot":76},"subscription":0}}"#,
            &pending,
            &listeners,
        );
        assert_eq!(seen.load(Ordering::SeqCst), 76);
    }
}
