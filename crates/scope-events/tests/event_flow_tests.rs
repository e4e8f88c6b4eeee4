//! End-to-end tests for publishing and consuming events between services.
//!
//! Services share an in-memory broker, which delivers every event to every
//! attached bus the same way Redis pub/sub does.
//!
//! Test flows:
//! 1. auth-service → notification-service verification mail request
//! 2. handler isolation across concurrently running handlers
//! 3. correlation chains across services
//! 4. unsubscribe and service-local filtering

#![cfg(feature = "memory")]

use scope_events::{
    connect_with_retry, handler_fn, AppEvent, EventBus, EventEnvelope, EventMetadata,
    HandlerError, MemoryBroker, MemoryEventBus, MetadataOverrides, RetryConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Received = mpsc::UnboundedReceiver<(AppEvent, EventMetadata)>;

/// Test fixture with one publishing and one consuming service.
struct TestFixture {
    /// Bus of the publishing service.
    auth: MemoryEventBus,
    /// Bus of the consuming service.
    notifications: MemoryEventBus,
}

impl TestFixture {
    /// Create both buses on a shared broker and connect them.
    async fn new() -> Self {
        let broker = MemoryBroker::new();
        let auth = MemoryEventBus::with_broker("auth-service", broker.clone());
        let notifications = MemoryEventBus::with_broker("notification-service", broker);

        connect_with_retry(&auth, &RetryConfig::connect())
            .await
            .unwrap();
        connect_with_retry(&notifications, &RetryConfig::connect())
            .await
            .unwrap();

        Self {
            auth,
            notifications,
        }
    }

    /// Subscribe the consuming service and collect what it receives.
    async fn record(&self, event_type: &str) -> Received {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notifications
            .subscribe(
                event_type,
                handler_fn(move |event, metadata| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((event, metadata));
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        rx
    }
}

async fn next(rx: &mut Received) -> (AppEvent, EventMetadata) {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

async fn nothing_arrives(rx: &mut Received) -> bool {
    tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err()
}

#[tokio::test]
async fn test_verification_request_reaches_notification_service() {
    let fixture = TestFixture::new().await;
    let mut rx = fixture.record("user.verification_requested").await;

    let published = fixture
        .auth
        .publish(AppEvent::verification_requested("a@b.com", "A", "t1"), None)
        .await
        .unwrap();

    let (event, metadata) = next(&mut rx).await;
    match event {
        AppEvent::UserVerificationRequested { email, token, .. } => {
            assert_eq!(email, "a@b.com");
            assert_eq!(token, "t1");
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(metadata.source, "auth-service");
    assert!(!metadata.event_id.is_empty());
    assert_eq!(metadata, published);
    assert!(nothing_arrives(&mut rx).await);
}

#[tokio::test]
async fn test_publisher_also_receives_its_own_events() {
    let fixture = TestFixture::new().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    fixture
        .auth
        .subscribe(
            "user.registered",
            handler_fn(move |event, metadata| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((event, metadata));
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let event: AppEvent = serde_json::from_value(serde_json::json!({
        "type": "user.registered",
        "userId": 1,
        "email": "a@b.com",
        "username": "ada",
        "timestamp": "2024-05-01T12:00:00Z"
    }))
    .unwrap();
    fixture.auth.publish(event.clone(), None).await.unwrap();

    let (received, _) = next(&mut rx).await;
    assert_eq!(received, event);
}

#[tokio::test]
async fn test_failing_handlers_do_not_block_others() {
    let fixture = TestFixture::new().await;
    let mut rx = fixture.record("user.password_reset_requested").await;

    fixture
        .notifications
        .subscribe(
            "user.password_reset_requested",
            handler_fn(|_, _| async { Err(HandlerError::failed("smtp unavailable")) }),
        )
        .await
        .unwrap();

    fixture
        .auth
        .publish(
            AppEvent::password_reset_requested("a@b.com", "A", "r1"),
            None,
        )
        .await
        .unwrap();

    let (event, _) = next(&mut rx).await;
    assert_eq!(event.event_type(), "user.password_reset_requested");

    // Outcomes are recorded once every handler has settled
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = fixture.notifications.stats().await;
    assert_eq!(stats.events_delivered, 1);
    assert_eq!(stats.events_failed, 1);
}

#[tokio::test]
async fn test_correlation_chain_across_services() {
    let fixture = TestFixture::new().await;
    let mut rx = fixture.record("user.verification_resend").await;

    let root = fixture
        .auth
        .publish(
            AppEvent::verification_requested("a@b.com", "A", "t1"),
            Some(MetadataOverrides::correlated("req-42")),
        )
        .await
        .unwrap();
    assert_eq!(root.correlation_id.as_deref(), Some("req-42"));

    fixture
        .auth
        .publish(
            AppEvent::verification_resend("a@b.com", "A", "t2"),
            Some(MetadataOverrides::caused_by(&root)),
        )
        .await
        .unwrap();

    let (_, metadata) = next(&mut rx).await;
    assert_eq!(metadata.correlation_id.as_deref(), Some("req-42"));
    assert_eq!(metadata.causation_id.as_deref(), Some(root.event_id.as_str()));
}

#[tokio::test]
async fn test_unsubscribe_stops_further_invocations() {
    let fixture = TestFixture::new().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let subscription = fixture
        .notifications
        .subscribe(
            "task.created",
            handler_fn(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
    let mut rx = fixture.record("task.created").await;

    let task = AppEvent::TaskCreated {
        task_id: 7,
        project_id: Some(3),
        user_id: None,
        title: "Write docs".to_string(),
        timestamp: chrono::Utc::now(),
    };

    fixture.auth.publish(task.clone(), None).await.unwrap();
    next(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(subscription.unsubscribe().await);

    fixture.auth.publish(task, None).await.unwrap();
    next(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wire_envelope_round_trip() {
    let envelope = EventEnvelope::new(
        AppEvent::verification_requested("a@b.com", "A", "t1"),
        EventMetadata::generate("auth-service", Some(MetadataOverrides::correlated("c-1"))),
    );

    let json = envelope.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["event"]["type"], envelope.event_type());
    assert_eq!(value["metadata"]["correlationId"], "c-1");

    assert_eq!(EventEnvelope::from_json(&json).unwrap(), envelope);
}
