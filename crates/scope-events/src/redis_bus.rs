//! Redis-backed event bus for distributed deployments.
//!
//! Every bus pattern-subscribes to `event:*` on a dedicated pub/sub
//! connection and publishes through a separate multiplexed connection.
//! Each process receives every event and filters by event type locally.

use crate::bus::{
    EventBus, EventBusError, EventBusResult, EventBusStats, EventHandler, Subscription,
};
use crate::config::{EventBusType, RedisConfig};
use crate::envelope::{EventEnvelope, EventMetadata, MetadataOverrides};
use crate::registry::HandlerRegistry;
use crate::types::AppEvent;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Prefix of every event channel.
pub const CHANNEL_PREFIX: &str = "event:";

/// Pattern the listener subscribes to.
pub const CHANNEL_PATTERN: &str = "event:*";

/// Channel an event type is published on.
pub fn channel_for(event_type: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, event_type)
}

/// Event type carried by a channel, if it is an event channel.
pub fn event_type_of(channel: &str) -> Option<&str> {
    channel.strip_prefix(CHANNEL_PREFIX)
}

/// Redis-backed event bus.
///
/// # Example
///
/// ```rust,no_run
/// use scope_events::{AppEvent, EventBus, RedisConfig, RedisEventBus};
///
/// async fn example() -> scope_events::EventBusResult<()> {
///     let bus = RedisEventBus::new("auth-service", RedisConfig::default());
///     bus.connect().await?;
///     bus.publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
///         .await?;
///     Ok(())
/// }
/// ```
pub struct RedisEventBus {
    service_name: String,
    config: RedisConfig,
    registry: Arc<HandlerRegistry>,

    /// Publisher connection, present while connected
    publisher: RwLock<Option<MultiplexedConnection>>,

    /// Background listener task handle
    listener_handle: Mutex<Option<JoinHandle<()>>>,

    connected: AtomicBool,
}

impl std::fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("service_name", &self.service_name)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisEventBus {
    /// Create a disconnected bus. No network I/O happens until
    /// [`connect`](EventBus::connect).
    pub fn new(service_name: impl Into<String>, config: RedisConfig) -> Self {
        let service_name = service_name.into();
        Self {
            registry: Arc::new(HandlerRegistry::new(service_name.clone())),
            service_name,
            config,
            publisher: RwLock::new(None),
            listener_handle: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn client(&self) -> EventBusResult<Client> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.config.host.clone(), self.config.port),
            redis: RedisConnectionInfo {
                password: self.config.password.clone(),
                ..Default::default()
            },
        };
        Client::open(info).map_err(|e| EventBusError::ConnectionError(e.to_string()))
    }
}

/// Receive messages until the pub/sub stream ends, dispatching each one
/// on its own task.
async fn redis_listener_loop(pubsub: PubSub, registry: Arc<HandlerRegistry>) {
    let mut messages = Box::pin(pubsub.into_on_message());

    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to get message payload");
                continue;
            }
        };
        let channel = msg.get_channel_name().to_string();

        let registry = registry.clone();
        tokio::spawn(async move {
            match EventEnvelope::from_json(&payload) {
                Ok(envelope) => {
                    if event_type_of(&channel) != Some(envelope.event_type()) {
                        tracing::debug!(
                            channel = %channel,
                            event_type = envelope.event_type(),
                            "Event type does not match channel"
                        );
                    }
                    registry.dispatch(envelope).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, channel = %channel, "Failed to handle Redis message");
                }
            }
        });
    }

    tracing::warn!("Redis pub/sub stream ended");
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn connect(&self) -> EventBusResult<()> {
        let mut handle_lock = self.listener_handle.lock().await;
        if handle_lock.is_some() {
            return Ok(());
        }

        let client = self.client()?;

        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;
        pubsub
            .psubscribe(CHANNEL_PATTERN)
            .await
            .map_err(|e| EventBusError::SubscribeError(e.to_string()))?;

        *self.publisher.write().await = Some(publisher);
        *handle_lock = Some(tokio::spawn(redis_listener_loop(
            pubsub,
            self.registry.clone(),
        )));
        self.connected.store(true, Ordering::SeqCst);

        tracing::info!(
            event_bus = "redis",
            service = %self.service_name,
            host = %self.config.host,
            port = self.config.port,
            pattern = CHANNEL_PATTERN,
            "Event bus connected"
        );
        Ok(())
    }

    async fn publish(
        &self,
        event: AppEvent,
        metadata: Option<MetadataOverrides>,
    ) -> EventBusResult<EventMetadata> {
        let mut conn = self
            .publisher
            .read()
            .await
            .clone()
            .ok_or(EventBusError::NotConnected)?;

        let metadata = EventMetadata::generate(&self.service_name, metadata);
        let envelope = EventEnvelope::new(event, metadata);
        let payload = envelope.to_json()?;
        let channel = channel_for(envelope.event_type());

        if let Err(e) = conn.publish::<_, _, ()>(&channel, &payload).await {
            tracing::error!(
                error = %e,
                event_type = envelope.event_type(),
                event_id = %envelope.metadata.event_id,
                "Failed to publish event"
            );
            return Err(EventBusError::PublishError(e.to_string()));
        }

        self.registry
            .metrics()
            .record_published(envelope.event_type())
            .await;
        tracing::debug!(
            channel = %channel,
            event_type = envelope.event_type(),
            event_id = %envelope.metadata.event_id,
            "Published event to Redis"
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
        self.publisher.write().await.take();
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
        EventBusType::Redis
    }

    async fn stats(&self) -> EventBusStats {
        EventBusStats::collect(&self.registry).await
    }
}
