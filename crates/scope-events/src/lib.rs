//! # Scope Events
//!
//! This crate provides the cross-service event bus for the Scope services
//! (auth, projects, tasks, teams, invoices, notifications and friends).
//!
//! ## Overview
//!
//! The scope-events crate handles:
//! - **Event Types**: one tagged union, [`AppEvent`], covering every domain event
//! - **Envelopes**: metadata (event id, correlation, source, version) attached at publish time
//! - **Event Bus**: publish/subscribe over Redis pub/sub, RabbitMQ or in memory
//! - **Dispatch**: concurrent handlers with per-handler failure isolation
//! - **Connection Management**: connect with exponential backoff, lazy publishers
//!
//! ## Features
//!
//! - `memory` (default): in-memory event bus for single-process apps and tests
//! - `redis`: Redis pub/sub event bus
//! - `rabbitmq`: RabbitMQ topic exchange event bus
//!
//! ## Usage
//!
//! ### Publishing Events
//!
//! ```rust,no_run
//! use scope_events::{AppEvent, EventBus, MemoryEventBus};
//!
//! async fn publish_example() -> scope_events::EventBusResult<()> {
//!     let bus = MemoryEventBus::new("auth-service");
//!     bus.connect().await?;
//!
//!     let metadata = bus
//!         .publish(AppEvent::verification_requested("a@b.com", "Ada", "t1"), None)
//!         .await?;
//!     println!("published {}", metadata.event_id);
//!     Ok(())
//! }
//! ```
//!
//! ### Subscribing to Events
//!
//! ```rust,no_run
//! use scope_events::{handler_fn, EventBus, MemoryEventBus};
//!
//! async fn subscribe_example() -> scope_events::EventBusResult<()> {
//!     let bus = MemoryEventBus::new("notification-service");
//!     bus.connect().await?;
//!
//!     let subscription = bus
//!         .subscribe(
//!             "user.verification_requested",
//!             handler_fn(|event, metadata| async move {
//!                 println!("{} from {}", event.event_type(), metadata.source);
//!                 Ok(())
//!             }),
//!         )
//!         .await?;
//!
//!     subscription.unsubscribe().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Routing
//!
//! The event type string (`user.verification_requested`, `task.created`, ...)
//! is the routing key everywhere:
//! - Redis: channel `event:<type>`, every process receives every event
//! - RabbitMQ: routing key `<type>` on the topic exchange, one durable
//!   queue `<service>.<type>` per subscribing service

pub mod bus;
pub mod config;
pub mod envelope;
pub mod lazy;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis_bus;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

// Re-export main types
pub use bus::{
    handler_fn, EventBus, EventBusError, EventBusResult, EventBusStats, EventHandler,
    HandlerError, HandlerResult, Subscription,
};
pub use config::{
    create_event_bus, ConfigError, EventBusConfig, EventBusType, RabbitMqConfig, RedisConfig,
};
pub use envelope::{EventEnvelope, EventMetadata, MetadataOverrides};
pub use lazy::LazyEventBus;
pub use metrics::EventTypeCounters;
pub use registry::DispatchReport;
pub use retry::{connect_with_retry, RetryConfig};
pub use types::{AppEvent, Changes};

#[cfg(feature = "memory")]
pub use bus::{MemoryBroker, MemoryEventBus};

#[cfg(feature = "redis")]
pub use redis_bus::RedisEventBus;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqEventBus;
