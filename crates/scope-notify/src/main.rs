//! Notification service event consumer.

use scope_events::{create_event_bus, EventBusConfig, RetryConfig};
use scope_notify::{init_tracing, start_event_consumer, LoggingEmailSender, DEFAULT_SERVICE_NAME};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let service_name =
        std::env::var("SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());
    let config = EventBusConfig::from_env(service_name)?;
    info!(
        service = %config.service_name,
        event_bus = %config.kind,
        "Starting notification service"
    );

    let bus = create_event_bus(&config)?;
    let sender = Arc::new(LoggingEmailSender::from_env());
    let consumer = start_event_consumer(bus.as_ref(), sender, &RetryConfig::connect()).await;

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    if let Some(consumer) = consumer {
        consumer.stop().await;
    }
    if let Err(e) = bus.disconnect().await {
        error!(error = %e, "Failed to disconnect event bus");
    }

    Ok(())
}
