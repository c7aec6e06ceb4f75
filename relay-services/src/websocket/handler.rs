//! WebSocket connection handler
//!
//! Registers each accepted connection, runs its writer task and watches
//! the inbound side purely for liveness. Subscribers are push-only; any
//! payload they send is ignored.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use relay_core::{AveragePrice, RelayError, RelayResult};

use super::registry::{Subscriber, SubscriberId, SubscriberRegistry};

/// Default outbound queue size per subscriber
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default limit for a single socket write
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the closing handshake frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-subscriber settings
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub queue_capacity: usize,
    pub write_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Why a subscriber connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a Close frame
    ClientClosed,
    /// Inbound stream ended without a Close frame
    StreamEnded,
    /// Inbound read failed
    ReadError(String),
    /// Writer stopped after the subscriber was removed (hub overflow, shutdown)
    WriterStopped,
    /// A socket write failed or timed out
    WriteFailed(String),
}

/// Decrements the in-flight connection count, even if the handler is dropped
struct ConnectionGuard(Arc<watch::Sender<usize>>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Accepts subscriber connections and tracks them until they go away
#[derive(Debug, Clone)]
pub struct ConnectionLifecycleManager {
    registry: Arc<SubscriberRegistry>,
    config: SubscriberConfig,
    active: Arc<watch::Sender<usize>>,
}

impl ConnectionLifecycleManager {
    pub fn new(registry: Arc<SubscriberRegistry>, config: SubscriberConfig) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            registry,
            config,
            active: Arc::new(active),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Connections whose handler has not returned yet
    pub fn active_connections(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolves once every connection handler has returned, close frames
    /// included
    pub async fn wait_until_idle(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }

    /// Drive one subscriber connection to completion.
    ///
    /// `Accepted -> Registered -> (Delivering)* -> Removed`. The subscriber
    /// is removed from the registry before this returns, whichever side
    /// noticed the failure first.
    pub async fn handle_connection<W, R, E>(&self, writer: W, mut reader: R) -> DisconnectReason
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        self.active.send_modify(|n| *n += 1);
        let _guard = ConnectionGuard(Arc::clone(&self.active));

        let id = self.registry.next_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.queue_capacity);
        let subscriber = Subscriber::new(id, outbound_tx);
        let close_signal = subscriber.close_signal();

        if !self.registry.add(subscriber) {
            error!("[WS] {} already registered, refusing connection", id);
            return DisconnectReason::WriterStopped;
        }
        info!(
            "[WS] New subscriber {} ({} live)",
            id,
            self.registry.len()
        );

        let mut writer_task = tokio::spawn(Self::write_loop(
            id,
            writer,
            outbound_rx,
            close_signal,
            Arc::clone(&self.registry),
            self.config.write_timeout,
        ));

        let (reason, writer_finished) = tokio::select! {
            reason = Self::watch_liveness(id, &mut reader) => (reason, false),
            result = &mut writer_task => (Self::writer_outcome(id, result), true),
        };

        // No-op if the writer or the hub got there first
        self.registry.remove(id);

        if !writer_finished {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[WS] {} after reader finished", e),
                Err(e) => warn!("[WS] Writer task for {} failed: {}", id, e),
            }
        }

        info!(
            "[WS] Subscriber {} disconnected: {:?} ({} live)",
            id,
            reason,
            self.registry.len()
        );
        reason
    }

    fn writer_outcome(
        id: SubscriberId,
        result: Result<RelayResult<()>, tokio::task::JoinError>,
    ) -> DisconnectReason {
        match result {
            Ok(Ok(())) => DisconnectReason::WriterStopped,
            Ok(Err(e)) => DisconnectReason::WriteFailed(e.to_string()),
            Err(e) => {
                warn!("[WS] Writer task for {} failed: {}", id, e);
                DisconnectReason::WriterStopped
            }
        }
    }

    /// Read until the connection is gone, ignoring payloads
    async fn watch_liveness<R, E>(id: SubscriberId, reader: &mut R) -> DisconnectReason
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        while let Some(result) = reader.next().await {
            match result {
                Ok(Message::Close(frame)) => {
                    debug!("[WS] Received close from {}: {:?}", id, frame);
                    return DisconnectReason::ClientClosed;
                }
                Ok(_) => {
                    debug!("[WS] Ignoring inbound frame from {}", id);
                }
                Err(e) => {
                    debug!("[WS] Read error for {}: {}", id, e);
                    return DisconnectReason::ReadError(e.to_string());
                }
            }
        }
        DisconnectReason::StreamEnded
    }

    /// Drain the subscriber's queue onto the socket.
    ///
    /// Returns `SubscriberWrite` if a write failed or timed out, `Ok` if the
    /// subscriber was closed from outside.
    async fn write_loop<W>(
        id: SubscriberId,
        mut writer: W,
        mut outbound_rx: mpsc::Receiver<AveragePrice>,
        close_signal: Arc<Notify>,
        registry: Arc<SubscriberRegistry>,
        write_timeout: Duration,
    ) -> RelayResult<()>
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        let mut outcome = Ok(());

        loop {
            let price = tokio::select! {
                biased;
                _ = close_signal.notified() => break,
                price = outbound_rx.recv() => match price {
                    Some(price) => price,
                    None => break,
                },
            };

            let json = match price.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("[WS] Failed to serialize {}: {}", price, e);
                    continue;
                }
            };

            match timeout(write_timeout, writer.send(Message::Text(json.into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    outcome = Err(RelayError::subscriber_write(id.to_string(), e.to_string()));
                    break;
                }
                Err(_) => {
                    outcome = Err(RelayError::subscriber_write(
                        id.to_string(),
                        format!("write timed out after {:?}", write_timeout),
                    ));
                    break;
                }
            }
        }

        if registry.remove(id) {
            debug!("[WS] Writer removed {}", id);
        }

        if let Err(e) = &outcome {
            warn!("[WS] {}", e);
        }

        // Best effort: the peer may already be gone
        let _ = timeout(CLOSE_TIMEOUT, writer.send(Message::Close(None))).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{BroadcastHub, OverflowPolicy};
    use futures::channel::mpsc as fmpsc;

    type Inbound = Result<Message, String>;

    fn manager(config: SubscriberConfig) -> (ConnectionLifecycleManager, Arc<SubscriberRegistry>) {
        let registry = Arc::new(SubscriberRegistry::new());
        (
            ConnectionLifecycleManager::new(Arc::clone(&registry), config),
            registry,
        )
    }

    async fn wait_for_len(registry: &SubscriberRegistry, len: usize) {
        timeout(Duration::from_secs(2), async {
            while registry.len() != len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    #[tokio::test]
    async fn test_registers_then_removes_on_client_close() {
        let (manager, registry) = manager(SubscriberConfig::default());
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Inbound>();

        let task = tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await });
        wait_for_len(&registry, 1).await;

        // Inbound payload is ignored
        in_tx.unbounded_send(Ok(Message::Text("hello".to_string().into()))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.len(), 1);

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let reason = task.await.unwrap();

        assert_eq!(reason, DisconnectReason::ClientClosed);
        assert!(registry.is_empty());

        // Only a close frame was ever written
        let written: Vec<Message> = out_rx.collect().await;
        assert_eq!(written, vec![Message::Close(None)]);
    }

    #[tokio::test]
    async fn test_pushes_json_number_to_subscriber() {
        let (manager, registry) = manager(SubscriberConfig::default());
        let (hub, price_rx) = BroadcastHub::new(Arc::clone(&registry), OverflowPolicy::Disconnect);
        hub.start(price_rx);

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
        let task = tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await });
        wait_for_len(&registry, 1).await;

        hub.publish(AveragePrice(100.0)).unwrap();
        let msg = timeout(Duration::from_secs(1), out_rx.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text("100.0".to_string().into()));

        drop(in_tx);
        assert_eq!(task.await.unwrap(), DisconnectReason::StreamEnded);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_removes_subscriber() {
        let (manager, registry) = manager(SubscriberConfig::default());
        let (out_tx, _out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
        let task = tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await });
        wait_for_len(&registry, 1).await;

        in_tx.unbounded_send(Err("connection reset".to_string())).unwrap();

        assert_eq!(
            task.await.unwrap(),
            DisconnectReason::ReadError("connection reset".to_string())
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_removes_subscriber() {
        let (manager, registry) = manager(SubscriberConfig::default());
        let (hub, price_rx) = BroadcastHub::new(Arc::clone(&registry), OverflowPolicy::Disconnect);
        hub.start(price_rx);

        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
        let task = tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await });
        wait_for_len(&registry, 1).await;

        // Socket gone: the next write fails
        drop(out_rx);
        hub.publish(AveragePrice(1.0)).unwrap();

        let reason = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        match reason {
            DisconnectReason::WriteFailed(message) => assert!(message.contains("subscriber-")),
            other => panic!("expected a write failure, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let config = SubscriberConfig {
            queue_capacity: 8,
            write_timeout: Duration::from_millis(50),
        };
        let (manager, registry) = manager(config);
        let (hub, price_rx) = BroadcastHub::new(Arc::clone(&registry), OverflowPolicy::Disconnect);
        hub.start(price_rx);

        // Nobody reads the socket, so the writer stalls
        let (out_tx, _out_rx) = fmpsc::channel::<Message>(0);
        let (_in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
        let task = tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await });
        wait_for_len(&registry, 1).await;

        hub.publish(AveragePrice(1.0)).unwrap();
        hub.publish(AveragePrice(2.0)).unwrap();

        let reason = timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        match reason {
            DisconnectReason::WriteFailed(message) => assert!(message.contains("timed out")),
            other => panic!("expected a write timeout, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_hub_removal_closes_connection() {
        let (manager, registry) = manager(SubscriberConfig::default());
        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
        let task = tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await });
        wait_for_len(&registry, 1).await;

        let id = registry.ids()[0];
        assert!(registry.remove(id));

        let reason = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::WriterStopped);
        assert_eq!(out_rx.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn test_each_connection_gets_its_own_entry() {
        let (manager, registry) = manager(SubscriberConfig::default());
        let mut inbound = Vec::new();
        let mut outbound = Vec::new();
        let mut tasks = Vec::new();

        for _ in 0..3 {
            let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
            let (in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await }));
            inbound.push(in_tx);
            outbound.push(out_rx);
        }
        wait_for_len(&registry, 3).await;

        inbound.remove(0);
        wait_for_len(&registry, 2).await;

        inbound.clear();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_idle_after_registry_drain() {
        let (manager, registry) = manager(SubscriberConfig::default());
        let mut outbound = Vec::new();
        let mut inbound = Vec::new();

        for _ in 0..2 {
            let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
            let (in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
            let manager = manager.clone();
            tokio::spawn(async move { manager.handle_connection(out_tx, in_rx).await });
            outbound.push(out_rx);
            inbound.push(in_tx);
        }
        wait_for_len(&registry, 2).await;
        assert_eq!(manager.active_connections(), 2);

        // Shutdown path: close everything through the registry, then wait
        for id in registry.ids() {
            registry.remove(id);
        }
        timeout(Duration::from_secs(2), manager.wait_until_idle())
            .await
            .expect("connections never finished");
        assert_eq!(manager.active_connections(), 0);

        // Each socket got its close frame before the handler returned
        for mut out_rx in outbound {
            assert_eq!(out_rx.next().await, Some(Message::Close(None)));
        }
    }
}
