//! Lazily connected publisher for request-path services.
//!
//! Services that only publish (auth-service sending verification mails,
//! for instance) should not block startup or requests on the broker. The
//! [`LazyEventBus`] connects in the background on first use and publishes
//! fire-and-forget.

use crate::bus::{EventBus, EventBusError, EventBusResult};
use crate::config::{create_event_bus, EventBusConfig};
use crate::types::AppEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long a connection attempt (and a caller waiting on one) may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type BusFactory = dyn Fn() -> EventBusResult<Arc<dyn EventBus>> + Send + Sync;

#[derive(Clone)]
enum LazyState {
    Idle,
    /// Connection attempt in flight, tagged with its attempt number.
    Connecting(u64),
    Ready(Arc<dyn EventBus>),
}

struct Inner {
    factory: Box<BusFactory>,
    state: watch::Sender<LazyState>,
    connect_timeout: Duration,
    attempts: AtomicU64,
}

impl Inner {
    /// Run one connection attempt. The result is only installed while the
    /// state still names this attempt; a `disconnect` in between wins.
    async fn connect(&self, attempt: u64) {
        let result = match (self.factory)() {
            Ok(bus) => match timeout(self.connect_timeout, bus.connect()).await {
                Ok(Ok(())) => Ok(bus),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(EventBusError::ConnectionError(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))),
            },
            Err(e) => Err(e),
        };

        let current =
            |state: &LazyState| matches!(state, LazyState::Connecting(a) if *a == attempt);

        match result {
            Ok(bus) => {
                let installed = self.state.send_if_modified(|state| {
                    if current(&*state) {
                        *state = LazyState::Ready(bus.clone());
                        true
                    } else {
                        false
                    }
                });

                if installed {
                    tracing::info!(
                        event_bus = %bus.kind(),
                        service = %bus.service_name(),
                        "Event bus connected"
                    );
                } else {
                    tracing::debug!("Disconnect requested during connect, closing bus");
                    if let Err(e) = bus.disconnect().await {
                        tracing::warn!(error = %e, "Failed to close abandoned event bus");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect event bus");
                self.state.send_if_modified(|state| {
                    if current(&*state) {
                        *state = LazyState::Idle;
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }
}

/// Event bus handle that connects on first use.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct LazyEventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LazyEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.borrow() {
            LazyState::Idle => "idle",
            LazyState::Connecting(_) => "connecting",
            LazyState::Ready(_) => "ready",
        };
        f.debug_struct("LazyEventBus")
            .field("state", &state)
            .field("connect_timeout", &self.inner.connect_timeout)
            .finish()
    }
}

impl LazyEventBus {
    /// Wrap a bus factory. The factory is called again after every failed
    /// connection attempt.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> EventBusResult<Arc<dyn EventBus>> + Send + Sync + 'static,
    {
        Self::with_timeout(factory, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Like [`new`](Self::new) with a custom connect timeout.
    pub fn with_timeout<F>(factory: F, connect_timeout: Duration) -> Self
    where
        F: Fn() -> EventBusResult<Arc<dyn EventBus>> + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(LazyState::Idle);
        Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                state,
                connect_timeout,
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Lazy bus for the backend selected by `config`.
    pub fn from_config(config: EventBusConfig) -> Self {
        Self::new(move || create_event_bus(&config))
    }

    /// Whether a connected bus is available.
    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.state.borrow(), LazyState::Ready(_))
    }

    /// Return the bus if it is connected.
    ///
    /// If a connection attempt is in flight this waits for it (bounded by
    /// the connect timeout). Otherwise it starts connecting in the
    /// background and returns `None` without waiting.
    pub async fn get(&self) -> Option<Arc<dyn EventBus>> {
        let current = self.inner.state.borrow().clone();
        match current {
            LazyState::Ready(bus) => Some(bus),
            LazyState::Connecting(_) => self.wait_ready().await,
            LazyState::Idle => {
                self.start_connect();
                None
            }
        }
    }

    /// Return the bus, starting a connection if needed and waiting for it.
    pub async fn connected(&self) -> Option<Arc<dyn EventBus>> {
        let current = self.inner.state.borrow().clone();
        if let LazyState::Ready(bus) = current {
            return Some(bus);
        }
        self.start_connect();
        self.wait_ready().await
    }

    /// Publish in the background. Errors are logged, never returned.
    pub fn publish_event(&self, event: AppEvent) -> JoinHandle<()> {
        let lazy = self.clone();
        tokio::spawn(async move {
            let event_type = event.event_type();
            match lazy.connected().await {
                Some(bus) => {
                    if let Err(e) = bus.publish(event, None).await {
                        tracing::error!(error = %e, event_type, "Failed to publish event");
                    }
                }
                None => {
                    tracing::warn!(event_type, "Event bus unavailable, event dropped");
                }
            }
        })
    }

    /// Disconnect the underlying bus. The next use reconnects.
    ///
    /// A connection attempt still in flight is abandoned: its bus is closed
    /// as soon as it comes up and never becomes ready.
    pub async fn disconnect(&self) -> EventBusResult<()> {
        let mut taken = None;
        self.inner.state.send_if_modified(|state| match state {
            LazyState::Ready(bus) => {
                taken = Some(bus.clone());
                *state = LazyState::Idle;
                true
            }
            LazyState::Connecting(_) => {
                *state = LazyState::Idle;
                true
            }
            LazyState::Idle => false,
        });

        match taken {
            Some(bus) => bus.disconnect().await,
            None => Ok(()),
        }
    }

    fn start_connect(&self) {
        let mut started = None;
        self.inner.state.send_if_modified(|state| {
            if matches!(state, LazyState::Idle) {
                let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed);
                *state = LazyState::Connecting(attempt);
                started = Some(attempt);
                true
            } else {
                false
            }
        });

        if let Some(attempt) = started {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.connect(attempt).await });
        }
    }

    async fn wait_ready(&self) -> Option<Arc<dyn EventBus>> {
        let mut rx = self.inner.state.subscribe();
        let settled = timeout(
            self.inner.connect_timeout,
            rx.wait_for(|state| !matches!(state, LazyState::Connecting(_))),
        )
        .await;

        match settled {
            Ok(Ok(state)) => match &*state {
                LazyState::Ready(bus) => Some(bus.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}
