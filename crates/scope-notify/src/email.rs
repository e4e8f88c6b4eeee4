//! Outgoing email seam.
//!
//! The consumer only decides *which* mail to send; delivery sits behind
//! [`EmailSender`]. The bundled [`LoggingEmailSender`] writes each mail to
//! the log, which is what the service does when no SMTP relay is
//! configured.

use async_trait::async_trait;
use thiserror::Error;

/// Default frontend base URL used in email links.
pub const DEFAULT_APP_URL: &str = "http://localhost:3000";

/// Email delivery errors.
#[derive(Debug, Error)]
pub enum EmailError {
    /// The mail could not be handed to the transport
    #[error("Failed to send email to {to}: {message}")]
    Delivery { to: String, message: String },

    /// The recipient address is unusable
    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),
}

/// Result type for email operations.
pub type EmailResult<T> = Result<T, EmailError>;

/// Sends the transactional mails triggered by user events.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send the email-address verification mail.
    async fn send_verification_email(&self, email: &str, name: &str, token: &str)
        -> EmailResult<()>;

    /// Send the password reset mail.
    async fn send_password_reset_email(
        &self,
        email: &str,
        name: &str,
        token: &str,
    ) -> EmailResult<()>;
}

/// A rendered mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    /// Action link embedded in the body
    pub link: String,
    pub body: String,
}

/// Builds mail contents and action links against the frontend URL.
#[derive(Debug, Clone)]
pub struct EmailTemplates {
    app_url: String,
}

impl EmailTemplates {
    /// Templates linking to `app_url`. A trailing slash is dropped.
    ///
    /// # Example
    ///
    /// ```
    /// use scope_notify::EmailTemplates;
    ///
    /// let templates = EmailTemplates::new("https://scope.example.com/");
    /// assert_eq!(
    ///     templates.verification_url("t1"),
    ///     "https://scope.example.com/verify-email?token=t1"
    /// );
    /// ```
    pub fn new(app_url: impl Into<String>) -> Self {
        let app_url = app_url.into();
        Self {
            app_url: app_url.trim_end_matches('/').to_string(),
        }
    }

    /// Read `APP_URL`, defaulting to the local frontend.
    pub fn from_env() -> Self {
        Self::new(std::env::var("APP_URL").unwrap_or_else(|_| DEFAULT_APP_URL.to_string()))
    }

    /// Link confirming an email address.
    pub fn verification_url(&self, token: &str) -> String {
        format!("{}/verify-email?token={}", self.app_url, token)
    }

    /// Link opening the password reset form.
    pub fn password_reset_url(&self, token: &str) -> String {
        format!("{}/reset-password?token={}", self.app_url, token)
    }

    /// Verification mail for a new or unconfirmed account.
    ///
    /// # Arguments
    ///
    /// * `email` - Recipient address
    /// * `name` - Name used in the greeting
    /// * `token` - Verification token embedded in the link
    pub fn verification(&self, email: &str, name: &str, token: &str) -> OutgoingEmail {
        let link = self.verification_url(token);
        OutgoingEmail {
            to: email.to_string(),
            subject: "Verify your email address".to_string(),
            body: format!(
                "Hi {},\n\nConfirm your email address by opening the link below:\n{}\n\n\
                 If you did not create an account, ignore this message.",
                name, link
            ),
            link,
        }
    }

    /// Password reset mail. Takes the same arguments as
    /// [`verification`](Self::verification).
    pub fn password_reset(&self, email: &str, name: &str, token: &str) -> OutgoingEmail {
        let link = self.password_reset_url(token);
        OutgoingEmail {
            to: email.to_string(),
            subject: "Reset your password".to_string(),
            body: format!(
                "Hi {},\n\nReset your password by opening the link below:\n{}\n\n\
                 If you did not request a reset, ignore this message.",
                name, link
            ),
            link,
        }
    }
}

impl Default for EmailTemplates {
    fn default() -> Self {
        Self::new(DEFAULT_APP_URL)
    }
}

/// Sender that logs each rendered mail instead of delivering it.
#[derive(Debug, Clone, Default)]
pub struct LoggingEmailSender {
    templates: EmailTemplates,
}

impl LoggingEmailSender {
    /// Sender rendering mails with `templates`.
    pub fn new(templates: EmailTemplates) -> Self {
        Self { templates }
    }

    /// Sender with templates from `APP_URL`.
    pub fn from_env() -> Self {
        Self::new(EmailTemplates::from_env())
    }

    fn log(&self, mail: &OutgoingEmail) -> EmailResult<()> {
        if !mail.to.contains('@') {
            return Err(EmailError::InvalidRecipient(mail.to.clone()));
        }
        tracing::info!(
            to = %mail.to,
            subject = %mail.subject,
            link = %mail.link,
            "Email (log transport)"
        );
        tracing::debug!(body = %mail.body, "Email body");
        Ok(())
    }
}

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send_verification_email(
        &self,
        email: &str,
        name: &str,
        token: &str,
    ) -> EmailResult<()> {
        self.log(&self.templates.verification(email, name, token))
    }

    async fn send_password_reset_email(
        &self,
        email: &str,
        name: &str,
        token: &str,
    ) -> EmailResult<()> {
        self.log(&self.templates.password_reset(email, name, token))
    }
}
