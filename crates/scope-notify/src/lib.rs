//! # Scope Notify
//!
//! Event consumer of the notification service. It listens for the user
//! mail requests published by the auth service and sends verification and
//! password reset emails.
//!
//! ## Environment
//!
//! - `SERVICE_NAME`: service name (default: notification-service)
//! - `APP_URL`: frontend base URL used in email links (default: http://localhost:3000)
//! - `RUST_LOG` / `LOG_LEVEL`: log filter (default: info)
//! - event bus variables, see [`scope_events::EventBusConfig::from_env`]

pub mod consumer;
pub mod email;

pub use consumer::{MailHandler, NotificationConsumer, SUBSCRIBED_EVENTS};
pub use email::{EmailError, EmailResult, EmailSender, EmailTemplates, LoggingEmailSender};

use scope_events::{connect_with_retry, EventBus, RetryConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Service name used when `SERVICE_NAME` is not set.
pub const DEFAULT_SERVICE_NAME: &str = "notification-service";

/// Initialize tracing from `RUST_LOG`, falling back to `LOG_LEVEL`, then "info".
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect the bus and start consuming.
///
/// Failures are logged and yield `None`; the service keeps running without
/// event consumption.
pub async fn start_event_consumer(
    bus: &dyn EventBus,
    sender: Arc<dyn EmailSender>,
    retry: &RetryConfig,
) -> Option<NotificationConsumer> {
    if let Err(e) = connect_with_retry(bus, retry).await {
        tracing::error!(error = %e, "Failed to start event consumer");
        return None;
    }

    match NotificationConsumer::start(bus, sender).await {
        Ok(consumer) => Some(consumer),
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up event subscriptions");
            None
        }
    }
}
