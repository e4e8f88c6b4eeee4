//! RabbitMQ-backed event bus.
//!
//! Events are published to a durable topic exchange with the event type as
//! routing key. Each service gets one durable queue per subscribed event
//! type, named `<service>.<eventType>`, so every service receives its own
//! copy while instances of the same service share the work.
//!
//! Deliveries are settled after dispatch: `ack` when every handler
//! succeeded (or none were registered), `nack` without requeue when the
//! envelope could not be parsed or any handler failed.
//!
//! Unsubscribing only removes the local handler. The queue stays declared
//! and bound, and later messages are acked without being handled.

use crate::bus::{
    EventBus, EventBusError, EventBusResult, EventBusStats, EventHandler, Subscription,
};
use crate::config::{EventBusType, RabbitMqConfig};
use crate::envelope::{EventEnvelope, EventMetadata, MetadataOverrides};
use crate::registry::{DispatchReport, HandlerRegistry};
use crate::types::AppEvent;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Content type of every published message.
pub const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// Queue a service consumes an event type from.
pub fn queue_name(service_name: &str, event_type: &str) -> String {
    format!("{}.{}", service_name, event_type)
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Remove the message from the queue
    Ack,
    /// Drop the message without requeueing it
    Reject,
}

impl DeliveryOutcome {
    /// Settlement for a dispatched message.
    pub fn from_report(report: &DispatchReport) -> Self {
        if report.is_success() {
            DeliveryOutcome::Ack
        } else {
            DeliveryOutcome::Reject
        }
    }
}

struct AmqpState {
    connection: Connection,
    channel: Channel,
}

/// RabbitMQ event bus.
pub struct RabbitMqEventBus {
    service_name: String,
    config: RabbitMqConfig,
    registry: Arc<HandlerRegistry>,
    state: Mutex<Option<AmqpState>>,

    /// One consumer task per event type
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,

    connected: AtomicBool,
}

impl std::fmt::Debug for RabbitMqEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqEventBus")
            .field("service_name", &self.service_name)
            .field("exchange", &self.config.exchange)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl RabbitMqEventBus {
    /// Create a disconnected bus.
    pub fn new(service_name: impl Into<String>, config: RabbitMqConfig) -> Self {
        let service_name = service_name.into();
        Self {
            registry: Arc::new(HandlerRegistry::new(service_name.clone())),
            service_name,
            config,
            state: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    async fn channel(&self) -> Option<Channel> {
        self.state.lock().await.as_ref().map(|s| s.channel.clone())
    }

    /// Declare and bind the queue for an event type and start consuming it.
    /// Does nothing if a consumer for the type is already running.
    async fn start_consumer(&self, channel: &Channel, event_type: &str) -> EventBusResult<()> {
        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(event_type) {
            return Ok(());
        }

        let queue = queue_name(&self.service_name, event_type);

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| EventBusError::SubscribeError(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &queue,
                &self.config.exchange,
                event_type,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| EventBusError::SubscribeError(format!("Failed to bind queue: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &queue,
                &queue,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                EventBusError::SubscribeError(format!("Failed to start consumer: {}", e))
            })?;

        tracing::info!(
            queue = %queue,
            exchange = %self.config.exchange,
            routing_key = event_type,
            "Bound queue to exchange"
        );

        let handle = tokio::spawn(consume_loop(consumer, queue, self.registry.clone()));
        consumers.insert(event_type.to_string(), handle);
        Ok(())
    }

    /// Declare the exchange and start consumers for handlers registered
    /// before connect.
    async fn declare_topology(&self, channel: &Channel) -> EventBusResult<()> {
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                EventBusError::ConnectionError(format!("Failed to declare exchange: {}", e))
            })?;

        for event_type in self.registry.event_types().await {
            self.start_consumer(channel, &event_type).await?;
        }
        Ok(())
    }

    async fn stop_consumers(&self) {
        for (_, handle) in self.consumers.lock().await.drain() {
            handle.abort();
        }
    }
}

/// Process deliveries one at a time until the consumer stream ends.
async fn consume_loop(mut consumer: Consumer, queue: String, registry: Arc<HandlerRegistry>) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => process_delivery(delivery, &registry).await,
            Err(e) => {
                tracing::error!(error = %e, queue = %queue, "Consumer delivery error");
                break;
            }
        }
    }
    tracing::warn!(queue = %queue, "Consumer stream ended");
}

async fn close_channel(channel: &Channel) {
    if let Err(e) = channel.close(200, "Bye").await {
        tracing::warn!(error = %e, "Failed to close channel");
    }
}

async fn close_connection(connection: &Connection) {
    if let Err(e) = connection.close(200, "Bye").await {
        tracing::warn!(error = %e, "Failed to close connection");
    }
}

async fn process_delivery(delivery: Delivery, registry: &HandlerRegistry) {
    let outcome = match EventEnvelope::from_bytes(&delivery.data) {
        Ok(envelope) => {
            tracing::debug!(
                routing_key = %delivery.routing_key,
                event_id = %envelope.metadata.event_id,
                "Received event"
            );
            DeliveryOutcome::from_report(&registry.dispatch(envelope).await)
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                routing_key = %delivery.routing_key,
                "Failed to handle RabbitMQ message"
            );
            DeliveryOutcome::Reject
        }
    };

    let settled = match outcome {
        DeliveryOutcome::Ack => delivery.ack(BasicAckOptions::default()).await,
        DeliveryOutcome::Reject => {
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
        }
    };
    if let Err(e) = settled {
        tracing::error!(error = %e, outcome = ?outcome, "Failed to settle message");
    }
}

#[async_trait]
impl EventBus for RabbitMqEventBus {
    async fn connect(&self) -> EventBusResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| EventBusError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection).await;
                return Err(EventBusError::ConnectionError(format!(
                    "Failed to create channel: {}",
                    e
                )));
            }
        };

        if let Err(e) = self.declare_topology(&channel).await {
            self.stop_consumers().await;
            close_channel(&channel).await;
            close_connection(&connection).await;
            return Err(e);
        }

        *state = Some(AmqpState {
            connection,
            channel,
        });
        self.connected.store(true, Ordering::SeqCst);

        tracing::info!(
            event_bus = "rabbitmq",
            service = %self.service_name,
            exchange = %self.config.exchange,
            "Event bus connected"
        );
        Ok(())
    }

    async fn publish(
        &self,
        event: AppEvent,
        metadata: Option<MetadataOverrides>,
    ) -> EventBusResult<EventMetadata> {
        let channel = self.channel().await.ok_or(EventBusError::NotConnected)?;

        let metadata = EventMetadata::generate(&self.service_name, metadata);
        let envelope = EventEnvelope::new(event, metadata);
        let payload = envelope.to_bytes()?;
        let routing_key = envelope.event_type();

        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT);

        let published = match channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm.await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            tracing::error!(
                error = %e,
                event_type = routing_key,
                event_id = %envelope.metadata.event_id,
                "Failed to publish event"
            );
            return Err(EventBusError::PublishError(e.to_string()));
        }

        self.registry.metrics().record_published(routing_key).await;
        tracing::debug!(
            exchange = %self.config.exchange,
            routing_key,
            event_id = %envelope.metadata.event_id,
            "Published event to RabbitMQ"
        );

        Ok(envelope.metadata)
    }

    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> EventBusResult<Subscription> {
        let id = self.registry.register(event_type, handler).await;

        if let Some(channel) = self.channel().await {
            if let Err(e) = self.start_consumer(&channel, event_type).await {
                self.registry.remove(event_type, &id).await;
                tracing::error!(error = %e, event_type, "Failed to subscribe");
                return Err(e);
            }
        }

        Ok(Subscription::new(id, event_type, &self.registry))
    }

    async fn disconnect(&self) -> EventBusResult<()> {
        self.stop_consumers().await;

        if let Some(state) = self.state.lock().await.take() {
            close_channel(&state.channel).await;
            close_connection(&state.connection).await;
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
        EventBusType::RabbitMq
    }

    async fn stats(&self) -> EventBusStats {
        EventBusStats::collect(&self.registry).await
    }
}
