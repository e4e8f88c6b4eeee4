//! Event counters
//!
//! Per-event-type counters for published events and handler outcomes,
//! mirroring the `events_published_total` and `events_processed_total`
//! series the services export.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Success,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Success => "success",
            ProcessingStatus::Error => "error",
        }
    }
}

/// Counters for one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventTypeCounters {
    /// Events of this type published by this bus
    pub published: u64,
    /// Handler invocations that succeeded
    pub succeeded: u64,
    /// Handler invocations that failed
    pub failed: u64,
}

/// Counter store owned by one bus instance.
#[derive(Debug, Default)]
pub struct EventMetrics {
    counters: RwLock<BTreeMap<String, EventTypeCounters>>,
}

impl EventMetrics {
    /// Empty counter store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a published event.
    pub async fn record_published(&self, event_type: &str) {
        let mut counters = self.counters.write().await;
        counters.entry(event_type.to_string()).or_default().published += 1;
    }

    /// Count a handler outcome.
    pub async fn record_processed(&self, event_type: &str, status: ProcessingStatus) {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(event_type.to_string()).or_default();
        match status {
            ProcessingStatus::Success => entry.succeeded += 1,
            ProcessingStatus::Error => entry.failed += 1,
        }
        tracing::trace!(
            metric = "events_processed_total",
            event_type,
            status = status.as_str(),
            "Recorded handler outcome"
        );
    }

    /// Counters for a single event type.
    pub async fn get(&self, event_type: &str) -> EventTypeCounters {
        self.counters
            .read()
            .await
            .get(event_type)
            .copied()
            .unwrap_or_default()
    }

    /// Copy of all counters.
    pub async fn snapshot(&self) -> BTreeMap<String, EventTypeCounters> {
        self.counters.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_per_event_type() {
        let metrics = EventMetrics::new();

        metrics.record_published("task.created").await;
        metrics.record_published("task.created").await;
        metrics
            .record_processed("task.created", ProcessingStatus::Success)
            .await;
        metrics
            .record_processed("task.created", ProcessingStatus::Error)
            .await;
        metrics.record_published("invoice.paid").await;

        let task = metrics.get("task.created").await;
        assert_eq!(
            task,
            EventTypeCounters {
                published: 2,
                succeeded: 1,
                failed: 1,
            }
        );
        assert_eq!(metrics.get("invoice.paid").await.published, 1);
        assert_eq!(metrics.get("file.deleted").await, EventTypeCounters::default());
        assert_eq!(metrics.snapshot().await.len(), 2);
    }
}
