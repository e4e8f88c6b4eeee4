//! Handler registry and dispatch
//!
//! Each bus owns one registry mapping event types to the handlers
//! registered for them. Dispatch runs every handler for an event
//! concurrently and captures each outcome on its own, so one failing or
//! panicking handler never affects the others.

use crate::bus::{EventHandler, HandlerError, HandlerResult};
use crate::envelope::EventEnvelope;
use crate::metrics::{EventMetrics, ProcessingStatus};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;

struct RegisteredHandler {
    id: String,
    handler: Arc<dyn EventHandler>,
}

/// Result of dispatching one envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that completed successfully
    pub succeeded: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

impl DispatchReport {
    /// Number of handlers invoked.
    pub fn handled(&self) -> usize {
        self.succeeded + self.failed
    }

    /// True when no handler failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Event type → handlers map owned by a bus instance.
pub struct HandlerRegistry {
    service_name: String,
    handlers: RwLock<HashMap<String, Vec<RegisteredHandler>>>,
    metrics: EventMetrics,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("service_name", &self.service_name)
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    ///
    /// * `service_name` - Name of the owning service, used in log fields
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            handlers: RwLock::new(HashMap::new()),
            metrics: EventMetrics::new(),
        }
    }

    /// Counters shared by publish and dispatch.
    pub fn metrics(&self) -> &EventMetrics {
        &self.metrics
    }

    /// Register a handler and return its subscription ID.
    pub async fn register(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> String {
        let id = uuid::Uuid::now_v7().to_string();
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push(RegisteredHandler {
                id: id.clone(),
                handler,
            });

        tracing::debug!(
            event_type,
            subscription_id = %id,
            service = %self.service_name,
            "Handler registered"
        );
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub async fn remove(&self, event_type: &str, id: &str) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|h| h.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event_type);
        }

        if removed {
            tracing::debug!(event_type, subscription_id = %id, "Handler removed");
        }
        removed
    }

    /// Handlers registered for an event type.
    pub async fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Handlers registered across all event types.
    pub async fn total_handlers(&self) -> usize {
        self.handlers.read().await.values().map(Vec::len).sum()
    }

    /// Event types with at least one handler.
    pub async fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run every handler registered for the envelope's event type.
    ///
    /// Handlers run concurrently; the call returns once all have settled.
    pub async fn dispatch(&self, envelope: EventEnvelope) -> DispatchReport {
        let event_type = envelope.event_type();
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let registered = self.handlers.read().await;
            match registered.get(event_type) {
                Some(list) => list.iter().map(|h| h.handler.clone()).collect(),
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            return DispatchReport::default();
        }

        let EventEnvelope { event, metadata } = envelope;
        let event_id = metadata.event_id.clone();

        let outcomes = join_all(handlers.into_iter().map(|handler| {
            let event = event.clone();
            let metadata = metadata.clone();
            async move {
                // The call itself sits inside the guarded future so a panic
                // while building the handler's future is captured too.
                AssertUnwindSafe(async move { handler.handle(event, metadata).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic))))
            }
        }))
        .await;

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            self.record_outcome(event_type, &event_id, outcome, &mut report)
                .await;
        }

        tracing::debug!(
            event_type,
            event_id = %event_id,
            succeeded = report.succeeded,
            failed = report.failed,
            "Event dispatched"
        );
        report
    }

    async fn record_outcome(
        &self,
        event_type: &str,
        event_id: &str,
        outcome: HandlerResult,
        report: &mut DispatchReport,
    ) {
        match outcome {
            Ok(()) => {
                report.succeeded += 1;
                self.metrics
                    .record_processed(event_type, ProcessingStatus::Success)
                    .await;
            }
            Err(e) => {
                report.failed += 1;
                self.metrics
                    .record_processed(event_type, ProcessingStatus::Error)
                    .await;
                tracing::error!(
                    error = %e,
                    event_type,
                    event_id,
                    service = %self.service_name,
                    "Event handler error"
                );
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
