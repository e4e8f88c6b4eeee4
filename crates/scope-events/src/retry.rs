//! Retry utilities with exponential backoff.
//!
//! Used to bring event bus connections up at service startup, when the
//! broker may still be starting.
//!
//! # Example
//!
//! ```rust,no_run
//! use scope_events::retry::{connect_with_retry, RetryConfig};
//! use scope_events::{EventBus, MemoryEventBus};
//!
//! async fn example() -> scope_events::EventBusResult<()> {
//!     let bus = MemoryEventBus::new("task-service");
//!     connect_with_retry(&bus, &RetryConfig::connect()).await
//! }
//! ```

use crate::bus::{EventBus, EventBusError, EventBusResult};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Base for exponential backoff
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::connect()
    }
}

impl RetryConfig {
    /// Broker connection policy: 5 attempts, waiting 1s, 2s, 4s, 8s.
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }

    /// A configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
        }
    }

    /// Delay after the given failed attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The failed attempt, counted from 1
    ///
    /// # Returns
    ///
    /// `initial_delay * exponential_base^(attempt - 1)`, capped at
    /// `max_delay`. Values that are not a valid duration (negative, NaN or
    /// out of range) fall back to `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
    }
}

/// Execute a function with retries.
///
/// The function is called up to `max_attempts` times, sleeping with
/// exponential backoff between failures. Returns the last error once the
/// attempts are used up.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, f, |_| true).await
}

/// Execute a function with retries, returning immediately on errors the
/// predicate rejects.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut f: F,
    mut is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !is_retryable(&e) => {
                tracing::debug!(error = %e, "Error is not retryable, returning immediately");
                return Err(e);
            }
            Err(e) if attempt >= config.max_attempts => {
                tracing::error!(attempts = attempt, error = %e, "All retry attempts exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_after(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Connect a bus, retrying with backoff.
///
/// # Arguments
///
/// * `bus` - The bus to connect
/// * `config` - Retry policy, usually [`RetryConfig::connect`]
///
/// # Returns
///
/// `Ok(())` once a connect succeeds. Every failure is retried; when the
/// attempts run out this fails with [`EventBusError::RetriesExhausted`]
/// carrying the error from the final attempt.
pub async fn connect_with_retry<B>(bus: &B, config: &RetryConfig) -> EventBusResult<()>
where
    B: EventBus + ?Sized,
{
    let attempts = AtomicU32::new(0);
    let counter = &attempts;
    let result = with_retry(config, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        bus.connect()
    })
    .await;
    let attempts = attempts.load(Ordering::SeqCst);

    match result {
        Ok(()) => {
            tracing::info!(
                event_bus = %bus.kind(),
                service = %bus.service_name(),
                attempts,
                "Event bus connected"
            );
            Ok(())
        }
        Err(last) => Err(EventBusError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBusStats, EventHandler, Subscription};
    use crate::config::EventBusType;
    use crate::envelope::{EventMetadata, MetadataOverrides};
    use crate::types::AppEvent;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Bus whose `connect` fails a fixed number of times.
    struct FlakyBus {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyBus {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventBus for FlakyBus {
        async fn connect(&self) -> EventBusResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(EventBusError::ConnectionError("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn publish(
            &self,
            _event: AppEvent,
            _metadata: Option<MetadataOverrides>,
        ) -> EventBusResult<EventMetadata> {
            Err(EventBusError::NotConnected)
        }

        async fn subscribe(
            &self,
            _event_type: &str,
            _handler: Arc<dyn EventHandler>,
        ) -> EventBusResult<Subscription> {
            Err(EventBusError::NotConnected)
        }

        async fn disconnect(&self) -> EventBusResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.calls.load(Ordering::SeqCst) > self.failures
        }

        fn service_name(&self) -> &str {
            "test-service"
        }

        fn kind(&self) -> EventBusType {
            EventBusType::Memory
        }

        async fn stats(&self) -> EventBusStats {
            EventBusStats::default()
        }
    }

    #[test]
    fn test_connect_policy_delays() {
        let config = RetryConfig::connect();
        let delays: Vec<u64> = (1..5).map(|a| config.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_delay_with_out_of_range_settings() {
        let unbounded = RetryConfig {
            max_attempts: 200,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::MAX,
            exponential_base: 2.0,
        };
        assert_eq!(unbounded.delay_after(150), Duration::MAX);

        let negative = RetryConfig {
            exponential_base: -2.0,
            ..RetryConfig::connect()
        };
        assert_eq!(negative.delay_after(2), negative.max_delay);

        let nan = RetryConfig {
            exponential_base: f64::NAN,
            ..RetryConfig::connect()
        };
        assert_eq!(nan.delay_after(3), nan.max_delay);
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
        };
        assert_eq!(config.delay_after(8), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds_after_four_failures() {
        let bus = FlakyBus::new(4);
        let start = Instant::now();

        connect_with_retry(&bus, &RetryConfig::connect())
            .await
            .unwrap();

        assert_eq!(bus.calls.load(Ordering::SeqCst), 5);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_five_attempts() {
        let bus = FlakyBus::new(u32::MAX);

        let err = connect_with_retry(&bus, &RetryConfig::connect())
            .await
            .unwrap_err();

        assert_eq!(bus.calls.load(Ordering::SeqCst), 5);
        assert!(matches!(err, EventBusError::RetriesExhausted { attempts: 5, .. }));
        assert_eq!(
            err.to_string(),
            "Failed to connect event bus after 5 attempts: Connection error: connection refused"
        );
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_try() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = with_retry(&RetryConfig::connect(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(42)
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_if_non_retryable_error() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = with_retry_if(
            &RetryConfig::connect(),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(EventBusError::BackendUnavailable("rabbitmq".to_string()))
            },
            EventBusError::is_transient,
        )
        .await;

        assert!(matches!(result, Err(EventBusError::BackendUnavailable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = with_retry(&RetryConfig::no_retry(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("down")
        })
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
