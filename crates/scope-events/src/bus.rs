//! Event bus implementation
//!
//! This module provides the event bus abstraction shared by every transport
//! and the in-memory implementation used for single-process deployments
//! and tests.

use crate::config::EventBusType;
use crate::envelope::{EventMetadata, MetadataOverrides};
use crate::metrics::EventTypeCounters;
use crate::registry::HandlerRegistry;
use crate::types::AppEvent;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Operation requires a connected bus
    #[error("Event bus is not connected")]
    NotConnected,

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Failed to publish event
    #[error("Failed to publish event: {0}")]
    PublishError(String),

    /// Failed to subscribe
    #[error("Failed to subscribe: {0}")]
    SubscribeError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Transport was not compiled into this build
    #[error("Event bus backend unavailable: {0}")]
    BackendUnavailable(String),

    /// `connect` kept failing until the retry budget ran out
    #[error("Failed to connect event bus after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of connection attempts made
        attempts: u32,
        /// Error from the final attempt
        last: Box<EventBusError>,
    },
}

impl EventBusError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EventBusError::ConnectionError(_)
                | EventBusError::PublishError(_)
                | EventBusError::SubscribeError(_)
        )
    }
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Error returned by an event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler reported a failure
    #[error("{0}")]
    Failed(String),

    /// Handler panicked while processing the event
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create a failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Result type for event handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Event handler trait for processing events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: AppEvent, metadata: EventMetadata) -> HandlerResult;
}

/// Handler backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as an [`EventHandler`].
///
/// ```rust
/// use scope_events::{handler_fn, AppEvent, EventMetadata};
///
/// let handler = handler_fn(|event: AppEvent, metadata: EventMetadata| async move {
///     println!("{} from {}", event.event_type(), metadata.source);
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(AppEvent, EventMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(AppEvent, EventMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, event: AppEvent, metadata: EventMetadata) -> HandlerResult {
        (self.f)(event, metadata).await
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle keeps the handler registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    event_type: String,
    registry: Weak<HandlerRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: String, event_type: &str, registry: &Arc<HandlerRegistry>) -> Self {
        Self {
            id,
            event_type: event_type.to_string(),
            registry: Arc::downgrade(registry),
        }
    }

    /// Subscription ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event type this subscription listens to
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove the handler from the local registry.
    ///
    /// Returns `false` if the handler was already gone or the bus was
    /// dropped. On RabbitMQ the queue stays declared and bound.
    pub async fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.event_type, &self.id).await,
            None => false,
        }
    }
}

/// Event bus trait for publish/subscribe operations.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Open the transport connections.
    ///
    /// Calling `connect` on a connected bus is a no-op.
    async fn connect(&self) -> EventBusResult<()>;

    /// Publish an event.
    ///
    /// Returns the metadata the event was published with.
    async fn publish(
        &self,
        event: AppEvent,
        metadata: Option<MetadataOverrides>,
    ) -> EventBusResult<EventMetadata>;

    /// Register a handler for an event type.
    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> EventBusResult<Subscription>;

    /// Close the transport connections.
    async fn disconnect(&self) -> EventBusResult<()>;

    /// Whether `connect` has completed and `disconnect` has not been called.
    fn is_connected(&self) -> bool;

    /// Name of the owning service, stamped as `metadata.source`.
    fn service_name(&self) -> &str;

    /// Transport kind.
    fn kind(&self) -> EventBusType;

    /// Get event bus stats.
    async fn stats(&self) -> EventBusStats;
}

/// Event bus statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBusStats {
    /// Total events published
    pub events_published: u64,
    /// Handler invocations that succeeded
    pub events_delivered: u64,
    /// Handler invocations that failed
    pub events_failed: u64,
    /// Registered handlers
    pub registered_handlers: usize,
    /// Counters per event type
    pub by_event_type: BTreeMap<String, EventTypeCounters>,
}

impl EventBusStats {
    pub(crate) async fn collect(registry: &HandlerRegistry) -> Self {
        let by_event_type = registry.metrics().snapshot().await;
        let mut stats = EventBusStats {
            registered_handlers: registry.total_handlers().await,
            ..Default::default()
        };
        for counters in by_event_type.values() {
            stats.events_published += counters.published;
            stats.events_delivered += counters.succeeded;
            stats.events_failed += counters.failed;
        }
        stats.by_event_type = by_event_type;
        stats
    }
}

// ============================================================================
// Memory Event Bus (Feature: memory)
// ============================================================================

#[cfg(feature = "memory")]
pub use memory_bus::{MemoryBroker, MemoryEventBus};

#[cfg(feature = "memory")]
mod memory_bus {
    //! In-process event bus.
    //!
    //! Buses that share a [`MemoryBroker`] behave like processes attached to
    //! the same Redis instance: every bus receives every event and filters
    //! by event type locally.

    use super::*;
    use crate::envelope::EventEnvelope;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{broadcast, Mutex};
    use tokio::task::JoinHandle;

    /// Shared in-process broker carrying serialized envelopes.
    #[derive(Debug, Clone)]
    pub struct MemoryBroker {
        sender: broadcast::Sender<String>,
    }

    impl MemoryBroker {
        /// Create a broker with the default channel capacity.
        pub fn new() -> Self {
            Self::with_capacity(1024)
        }

        /// Create with custom channel capacity.
        pub fn with_capacity(capacity: usize) -> Self {
            let (sender, _) = broadcast::channel(capacity);
            Self { sender }
        }
    }

    impl Default for MemoryBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    /// In-memory event bus implementation.
    ///
    /// This is suitable for single-process applications and testing.
    /// For distributed systems, use the Redis or RabbitMQ backend.
    pub struct MemoryEventBus {
        service_name: String,
        broker: MemoryBroker,
        registry: Arc<HandlerRegistry>,
        listener_handle: Mutex<Option<JoinHandle<()>>>,
        connected: AtomicBool,
    }

    impl std::fmt::Debug for MemoryEventBus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MemoryEventBus")
                .field("service_name", &self.service_name)
                .field("connected", &self.connected.load(Ordering::Relaxed))
                .finish()
        }
    }

    impl MemoryEventBus {
        /// Create a bus with its own private broker.
        pub fn new(service_name: impl Into<String>) -> Self {
            Self::with_broker(service_name, MemoryBroker::new())
        }

        /// Create a bus attached to a shared broker.
        pub fn with_broker(service_name: impl Into<String>, broker: MemoryBroker) -> Self {
            let service_name = service_name.into();
            Self {
                registry: Arc::new(HandlerRegistry::new(service_name.clone())),
                service_name,
                broker,
                listener_handle: Mutex::new(None),
                connected: AtomicBool::new(false),
            }
        }

        /// Dispatch an envelope to this bus's handlers and wait for them.
        pub async fn deliver(&self, envelope: EventEnvelope) -> crate::registry::DispatchReport {
            self.registry.dispatch(envelope).await
        }
    }

    async fn memory_listener_loop(
        mut receiver: broadcast::Receiver<String>,
        registry: Arc<HandlerRegistry>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        match EventEnvelope::from_json(&payload) {
                            Ok(envelope) => {
                                registry.dispatch(envelope).await;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to handle in-memory message");
                            }
                        }
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "In-memory listener lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    #[async_trait]
    impl EventBus for MemoryEventBus {
        async fn connect(&self) -> EventBusResult<()> {
            let mut handle_lock = self.listener_handle.lock().await;
            if handle_lock.is_some() {
                return Ok(());
            }

            let receiver = self.broker.sender.subscribe();
            let registry = self.registry.clone();
            *handle_lock = Some(tokio::spawn(memory_listener_loop(receiver, registry)));
            self.connected.store(true, Ordering::SeqCst);

            tracing::info!(
                event_bus = "memory",
                service = %self.service_name,
                "Event bus connected"
            );
            Ok(())
        }

        async fn publish(
            &self,
            event: AppEvent,
            metadata: Option<MetadataOverrides>,
        ) -> EventBusResult<EventMetadata> {
            if !self.is_connected() {
                return Err(EventBusError::NotConnected);
            }

            let metadata = EventMetadata::generate(&self.service_name, metadata);
            let envelope = EventEnvelope::new(event, metadata);
            let payload = envelope.to_json()?;

            // No receivers is not an error, same as PUBLISH reaching zero clients
            let _ = self.broker.sender.send(payload);

            self.registry
                .metrics()
                .record_published(envelope.event_type())
                .await;
            tracing::debug!(
                event_type = envelope.event_type(),
                event_id = %envelope.metadata.event_id,
                service = %self.service_name,
                "Event published"
            );

            Ok(envelope.metadata)
        }

        async fn subscribe(
            &self,
            event_type: &str,
            handler: Arc<dyn EventHandler>,
        ) -> EventBusResult<Subscription> {
            let id = self.registry.register(event_type, handler).await;
            Ok(Subscription::new(id, event_type, &self.registry))
        }

        async fn disconnect(&self) -> EventBusResult<()> {
            if let Some(handle) = self.listener_handle.lock().await.take() {
                handle.abort();
            }
            self.connected.store(false, Ordering::SeqCst);
            tracing::info!(service = %self.service_name, "Event bus disconnected");
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn service_name(&self) -> &str {
            &self.service_name
        }

        fn kind(&self) -> EventBusType {
            EventBusType::Memory
        }

        async fn stats(&self) -> EventBusStats {
            EventBusStats::collect(&self.registry).await
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn recording_handler(
        tx: mpsc::UnboundedSender<(AppEvent, EventMetadata)>,
    ) -> Arc<dyn EventHandler> {
        handler_fn(move |event, metadata| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((event, metadata));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let bus = MemoryEventBus::new("auth-service");
        let err = bus
            .publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::NotConnected));
    }

    #[tokio::test]
    async fn test_memory_event_bus_publish_subscribe() {
        let bus = MemoryEventBus::new("auth-service");
        bus.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("user.verification_requested", recording_handler(tx))
            .await
            .unwrap();

        let published = bus
            .publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
            .await
            .unwrap();

        let (event, metadata) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.event_type(), "user.verification_requested");
        assert_eq!(metadata, published);
        assert_eq!(metadata.source, "auth-service");
        assert!(!metadata.event_id.is_empty());
    }

    #[tokio::test]
    async fn test_other_event_types_are_filtered() {
        let bus = MemoryEventBus::new("task-service");
        bus.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("task.completed", recording_handler(tx))
            .await
            .unwrap();

        bus.publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MemoryEventBus::new("auth-service");
        bus.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Unsubscribing drops the handler; a second sender keeps the channel open.
        let _keep_open = tx.clone();
        let sub = bus
            .subscribe("user.verification_requested", recording_handler(tx))
            .await
            .unwrap();
        assert!(sub.unsubscribe().await);
        assert_eq!(bus.stats().await.registered_handlers, 0);

        bus.publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(received, Ok(Some(_))));
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_deliver_reports_handler_outcomes() {
        let bus = MemoryEventBus::new("notification-service");
        bus.subscribe(
            "user.verification_requested",
            handler_fn(|_, _| async { Ok(()) }),
        )
        .await
        .unwrap();
        bus.subscribe(
            "user.verification_requested",
            handler_fn(|_, _| async { Err(HandlerError::failed("smtp down")) }),
        )
        .await
        .unwrap();

        let envelope = EventEnvelope::new(
            AppEvent::verification_requested("a@b.com", "A", "t1"),
            EventMetadata::generate("auth-service", None),
        );
        let report = bus.deliver(envelope).await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let bus = MemoryEventBus::new("auth-service");
        bus.connect().await.unwrap();

        let stats = bus.stats().await;
        assert_eq!(stats.events_published, 0);
        assert_eq!(stats.registered_handlers, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("user.verification_requested", recording_handler(tx))
            .await
            .unwrap();
        bus.publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        // The handler runs before its outcome is recorded
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = bus.stats().await;
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.registered_handlers, 1);
        assert_eq!(
            stats.by_event_type["user.verification_requested"].published,
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect() {
        let bus = MemoryEventBus::new("auth-service");
        bus.connect().await.unwrap();
        assert!(bus.is_connected());

        bus.disconnect().await.unwrap();
        assert!(!bus.is_connected());
        assert!(bus
            .publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
            .await
            .is_err());
    }

    #[test]
    fn test_retries_exhausted_message() {
        let err = EventBusError::RetriesExhausted {
            attempts: 5,
            last: Box::new(EventBusError::ConnectionError("refused".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "Failed to connect event bus after 5 attempts: Connection error: refused"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(EventBusError::ConnectionError("x".to_string()).is_transient());
        assert!(!EventBusError::BackendUnavailable("redis".to_string()).is_transient());
        assert!(!EventBusError::NotConnected.is_transient());
    }
}
