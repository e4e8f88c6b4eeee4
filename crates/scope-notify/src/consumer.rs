//! User event consumer.
//!
//! Turns `user.*` mail requests published by the auth service into
//! verification and password reset emails.

use crate::email::EmailSender;
use async_trait::async_trait;
use scope_events::{
    AppEvent, EventBus, EventBusResult, EventHandler, EventMetadata, HandlerError, HandlerResult,
    Subscription,
};
use std::sync::Arc;

/// Event types the consumer subscribes to.
pub const SUBSCRIBED_EVENTS: [&str; 3] = [
    "user.verification_requested",
    "user.verification_resend",
    "user.password_reset_requested",
];

/// Handler routing user events to the matching mail.
pub struct MailHandler {
    sender: Arc<dyn EmailSender>,
}

impl MailHandler {
    /// Handler delivering through `sender`.
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventHandler for MailHandler {
    async fn handle(&self, event: AppEvent, metadata: EventMetadata) -> HandlerResult {
        let sent = match &event {
            AppEvent::UserVerificationRequested {
                email, name, token, ..
            } => {
                tracing::info!(
                    email = %email,
                    event_id = %metadata.event_id,
                    "Processing verification email request"
                );
                self.sender.send_verification_email(email, name, token).await
            }
            AppEvent::UserVerificationResend {
                email, name, token, ..
            } => {
                tracing::info!(
                    email = %email,
                    event_id = %metadata.event_id,
                    "Processing verification email resend"
                );
                self.sender.send_verification_email(email, name, token).await
            }
            AppEvent::UserPasswordResetRequested {
                email, name, token, ..
            } => {
                tracing::info!(
                    email = %email,
                    event_id = %metadata.event_id,
                    "Processing password reset email"
                );
                self.sender.send_password_reset_email(email, name, token).await
            }
            other => {
                tracing::debug!(event_type = other.event_type(), "Ignoring event");
                return Ok(());
            }
        };

        sent.map_err(|e| HandlerError::failed(e.to_string()))
    }
}

/// Running subscription set of the notification service.
pub struct NotificationConsumer {
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for NotificationConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationConsumer")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl NotificationConsumer {
    /// Subscribe the mail handler to every user mail event.
    ///
    /// If one subscription fails, the ones already made are removed again.
    pub async fn start(
        bus: &dyn EventBus,
        sender: Arc<dyn EmailSender>,
    ) -> EventBusResult<Self> {
        let handler: Arc<dyn EventHandler> = Arc::new(MailHandler::new(sender));
        let mut subscriptions = Vec::with_capacity(SUBSCRIBED_EVENTS.len());

        for event_type in SUBSCRIBED_EVENTS {
            match bus.subscribe(event_type, handler.clone()).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    for subscription in subscriptions {
                        subscription.unsubscribe().await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            service = %bus.service_name(),
            subscriptions = subscriptions.len(),
            "Event subscriptions set up"
        );
        Ok(Self { subscriptions })
    }

    /// Event types currently subscribed.
    pub fn event_types(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.event_type()).collect()
    }

    /// Remove every subscription.
    pub async fn stop(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe().await;
        }
        tracing::info!("Event consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{EmailError, EmailResult};
    use scope_events::{EventEnvelope, MemoryEventBus};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Verification(String, String),
        PasswordReset(String, String),
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Sent>>,
        fail: bool,
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send_verification_email(
            &self,
            email: &str,
            _name: &str,
            token: &str,
        ) -> EmailResult<()> {
            if self.fail {
                return Err(EmailError::Delivery {
                    to: email.to_string(),
                    message: "relay down".to_string(),
                });
            }
            self.sent
                .lock()
                .await
                .push(Sent::Verification(email.to_string(), token.to_string()));
            Ok(())
        }

        async fn send_password_reset_email(
            &self,
            email: &str,
            _name: &str,
            token: &str,
        ) -> EmailResult<()> {
            self.sent
                .lock()
                .await
                .push(Sent::PasswordReset(email.to_string(), token.to_string()));
            Ok(())
        }
    }

    fn envelope(event: AppEvent) -> EventEnvelope {
        EventEnvelope::new(event, EventMetadata::generate("auth-service", None))
    }

    #[tokio::test]
    async fn test_routes_user_events_to_mails() {
        let bus = MemoryEventBus::new("notification-service");
        let sender = Arc::new(RecordingSender::default());
        let consumer = NotificationConsumer::start(&bus, sender.clone())
            .await
            .unwrap();
        assert_eq!(consumer.event_types(), SUBSCRIBED_EVENTS.to_vec());

        bus.deliver(envelope(AppEvent::verification_requested("a@b.com", "A", "t1")))
            .await;
        bus.deliver(envelope(AppEvent::verification_resend("a@b.com", "A", "t2")))
            .await;
        bus.deliver(envelope(AppEvent::password_reset_requested("a@b.com", "A", "r1")))
            .await;

        assert_eq!(
            *sender.sent.lock().await,
            vec![
                Sent::Verification("a@b.com".to_string(), "t1".to_string()),
                Sent::Verification("a@b.com".to_string(), "t2".to_string()),
                Sent::PasswordReset("a@b.com".to_string(), "r1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_sender_failure_fails_handler() {
        let bus = MemoryEventBus::new("notification-service");
        let sender = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let _consumer = NotificationConsumer::start(&bus, sender).await.unwrap();

        let report = bus
            .deliver(envelope(AppEvent::verification_requested("a@b.com", "A", "t1")))
            .await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_unrelated_events_are_ignored() {
        let handler = MailHandler::new(Arc::new(RecordingSender::default()));
        let event = AppEvent::TeamMemberAdded {
            team_id: 1,
            user_id: 2,
            role: "member".to_string(),
            timestamp: chrono::Utc::now(),
        };
        handler
            .handle(event, EventMetadata::generate("team-service", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let bus = MemoryEventBus::new("notification-service");
        let consumer =
            NotificationConsumer::start(&bus, Arc::new(RecordingSender::default()))
                .await
                .unwrap();
        assert_eq!(bus.stats().await.registered_handlers, 3);

        consumer.stop().await;
        assert_eq!(bus.stats().await.registered_handlers, 0);
    }
}
