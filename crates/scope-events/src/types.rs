//! Event types for cross-service communication
//!
//! This module defines every domain event that the Scope services publish
//! and consume. Events are a single tagged union keyed by the `type` field,
//! which doubles as the Redis channel suffix and the RabbitMQ routing key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form map of changed fields carried by `*.updated` events.
pub type Changes = HashMap<String, serde_json::Value>;

/// All domain events exchanged between services.
///
/// Serialized with an internal `type` tag and camelCase field names, e.g.
/// `{"type":"task.created","taskId":7,"title":"Write docs","timestamp":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum AppEvent {
    // ------------------------------------------------------------------
    // Auth / user service
    // ------------------------------------------------------------------
    /// A user account was created
    #[serde(rename = "user.registered")]
    UserRegistered {
        user_id: i64,
        email: String,
        username: String,
        timestamp: DateTime<Utc>,
    },
    /// A user confirmed their email address
    #[serde(rename = "user.verified")]
    UserVerified {
        user_id: i64,
        email: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "user.logged_in")]
    UserLoggedIn {
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "user.logged_out")]
    UserLoggedOut {
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
    /// A verification email must be sent
    #[serde(rename = "user.verification_requested")]
    UserVerificationRequested {
        email: String,
        name: String,
        token: String,
        timestamp: DateTime<Utc>,
    },
    /// A verification email must be sent again
    #[serde(rename = "user.verification_resend")]
    UserVerificationResend {
        email: String,
        name: String,
        token: String,
        timestamp: DateTime<Utc>,
    },
    /// A password reset email must be sent
    #[serde(rename = "user.password_reset_requested")]
    UserPasswordResetRequested {
        email: String,
        name: String,
        token: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "user.password_changed")]
    UserPasswordChanged {
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "user.updated")]
    UserUpdated {
        user_id: i64,
        changes: Changes,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "user.deleted")]
    UserDeleted {
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "friendship.created")]
    FriendshipCreated {
        sender_id: i64,
        receiver_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "friendship.accepted")]
    FriendshipAccepted {
        sender_id: i64,
        receiver_id: i64,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Project service
    // ------------------------------------------------------------------
    #[serde(rename = "project.created")]
    ProjectCreated {
        project_id: i64,
        user_id: i64,
        name: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "project.updated")]
    ProjectUpdated {
        project_id: i64,
        changes: Changes,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "project.deleted")]
    ProjectDeleted {
        project_id: i64,
        timestamp: DateTime<Utc>,
    },
    /// Progress is a percentage in `0.0..=100.0`
    #[serde(rename = "project.progress.updated")]
    ProjectProgressUpdated {
        project_id: i64,
        progress: f64,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Task service
    // ------------------------------------------------------------------
    #[serde(rename = "task.created")]
    TaskCreated {
        task_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        title: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "task.updated")]
    TaskUpdated {
        task_id: i64,
        changes: Changes,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<i64>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "task.assigned")]
    TaskAssigned {
        task_id: i64,
        assignee_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "comment.created")]
    CommentCreated {
        comment_id: i64,
        entity_type: String,
        entity_id: i64,
        user_id: i64,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Team service
    // ------------------------------------------------------------------
    #[serde(rename = "team.created")]
    TeamCreated {
        team_id: i64,
        owner_id: i64,
        name: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "team.member.added")]
    TeamMemberAdded {
        team_id: i64,
        user_id: i64,
        role: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "team.member.removed")]
    TeamMemberRemoved {
        team_id: i64,
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "team.project.added")]
    TeamProjectAdded {
        team_id: i64,
        project_id: i64,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------
    #[serde(rename = "chat.message.created")]
    ChatMessageCreated {
        message_id: i64,
        chat_id: i64,
        sender_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "chat.message.updated")]
    ChatMessageUpdated {
        message_id: i64,
        chat_id: i64,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Invoice / financial service
    // ------------------------------------------------------------------
    #[serde(rename = "invoice.created")]
    InvoiceCreated {
        invoice_id: i64,
        project_id: i64,
        amount: f64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "invoice.sent")]
    InvoiceSent {
        invoice_id: i64,
        recipient_email: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "invoice.paid")]
    InvoicePaid {
        invoice_id: i64,
        amount: f64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "payment.processed")]
    PaymentProcessed {
        payment_id: i64,
        invoice_id: i64,
        amount: f64,
        status: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "expense.created")]
    ExpenseCreated {
        expense_id: i64,
        project_id: i64,
        amount: f64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "budget.exceeded")]
    BudgetExceeded {
        project_id: i64,
        budget: f64,
        spent: f64,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // File service
    // ------------------------------------------------------------------
    #[serde(rename = "file.uploaded")]
    FileUploaded {
        file_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<i64>,
        file_name: String,
        /// Size in bytes
        file_size: u64,
        uploaded_by: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "file.deleted")]
    FileDeleted {
        file_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "file.version.created")]
    FileVersionCreated {
        file_id: i64,
        version: u32,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Time tracking
    // ------------------------------------------------------------------
    /// Duration is in seconds
    #[serde(rename = "time.entry.created")]
    TimeEntryCreated {
        entry_id: i64,
        user_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<i64>,
        duration: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "time.entry.updated")]
    TimeEntryUpdated {
        entry_id: i64,
        changes: Changes,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "time.clocked.in")]
    TimeClockedIn {
        entry_id: i64,
        user_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "time.clocked.out")]
    TimeClockedOut {
        entry_id: i64,
        user_id: i64,
        duration: i64,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Notification service
    // ------------------------------------------------------------------
    #[serde(rename = "notification.created")]
    NotificationCreated {
        notification_id: i64,
        user_id: i64,
        notification_type: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "notification.sent")]
    NotificationSent {
        notification_id: i64,
        user_id: i64,
        channel: String,
        timestamp: DateTime<Utc>,
    },

    // ------------------------------------------------------------------
    // Analytics / AI
    // ------------------------------------------------------------------
    #[serde(rename = "report.generated")]
    ReportGenerated {
        report_id: i64,
        user_id: i64,
        report_type: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "ai.analysis.completed")]
    AiAnalysisCompleted {
        project_id: i64,
        analysis_id: String,
        results: Changes,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "ai.report.generated")]
    AiReportGenerated {
        report_id: i64,
        project_id: i64,
        timestamp: DateTime<Utc>,
    },
}

impl AppEvent {
    /// Get the event type string (the serialized `type` tag).
    ///
    /// This is the routing key on RabbitMQ and the suffix of the
    /// `event:<type>` channel on Redis.
    pub fn event_type(&self) -> &'static str {
        match self {
            AppEvent::UserRegistered { .. } => "user.registered",
            AppEvent::UserVerified { .. } => "user.verified",
            AppEvent::UserLoggedIn { .. } => "user.logged_in",
            AppEvent::UserLoggedOut { .. } => "user.logged_out",
            AppEvent::UserVerificationRequested { .. } => "user.verification_requested",
            AppEvent::UserVerificationResend { .. } => "user.verification_resend",
            AppEvent::UserPasswordResetRequested { .. } => "user.password_reset_requested",
            AppEvent::UserPasswordChanged { .. } => "user.password_changed",
            AppEvent::UserUpdated { .. } => "user.updated",
            AppEvent::UserDeleted { .. } => "user.deleted",
            AppEvent::FriendshipCreated { .. } => "friendship.created",
            AppEvent::FriendshipAccepted { .. } => "friendship.accepted",
            AppEvent::ProjectCreated { .. } => "project.created",
            AppEvent::ProjectUpdated { .. } => "project.updated",
            AppEvent::ProjectDeleted { .. } => "project.deleted",
            AppEvent::ProjectProgressUpdated { .. } => "project.progress.updated",
            AppEvent::TaskCreated { .. } => "task.created",
            AppEvent::TaskUpdated { .. } => "task.updated",
            AppEvent::TaskCompleted { .. } => "task.completed",
            AppEvent::TaskAssigned { .. } => "task.assigned",
            AppEvent::CommentCreated { .. } => "comment.created",
            AppEvent::TeamCreated { .. } => "team.created",
            AppEvent::TeamMemberAdded { .. } => "team.member.added",
            AppEvent::TeamMemberRemoved { .. } => "team.member.removed",
            AppEvent::TeamProjectAdded { .. } => "team.project.added",
            AppEvent::ChatMessageCreated { .. } => "chat.message.created",
            AppEvent::ChatMessageUpdated { .. } => "chat.message.updated",
            AppEvent::InvoiceCreated { .. } => "invoice.created",
            AppEvent::InvoiceSent { .. } => "invoice.sent",
            AppEvent::InvoicePaid { .. } => "invoice.paid",
            AppEvent::PaymentProcessed { .. } => "payment.processed",
            AppEvent::ExpenseCreated { .. } => "expense.created",
            AppEvent::BudgetExceeded { .. } => "budget.exceeded",
            AppEvent::FileUploaded { .. } => "file.uploaded",
            AppEvent::FileDeleted { .. } => "file.deleted",
            AppEvent::FileVersionCreated { .. } => "file.version.created",
            AppEvent::TimeEntryCreated { .. } => "time.entry.created",
            AppEvent::TimeEntryUpdated { .. } => "time.entry.updated",
            AppEvent::TimeClockedIn { .. } => "time.clocked.in",
            AppEvent::TimeClockedOut { .. } => "time.clocked.out",
            AppEvent::NotificationCreated { .. } => "notification.created",
            AppEvent::NotificationSent { .. } => "notification.sent",
            AppEvent::ReportGenerated { .. } => "report.generated",
            AppEvent::AiAnalysisCompleted { .. } => "ai.analysis.completed",
            AppEvent::AiReportGenerated { .. } => "ai.report.generated",
        }
    }

    /// Convenience constructor for `user.verification_requested`.
    pub fn verification_requested(
        email: impl Into<String>,
        name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        AppEvent::UserVerificationRequested {
            email: email.into(),
            name: name.into(),
            token: token.into(),
            timestamp: Utc::now(),
        }
    }

    /// Convenience constructor for `user.verification_resend`.
    pub fn verification_resend(
        email: impl Into<String>,
        name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        AppEvent::UserVerificationResend {
            email: email.into(),
            name: name.into(),
            token: token.into(),
            timestamp: Utc::now(),
        }
    }

    /// Convenience constructor for `user.password_reset_requested`.
    pub fn password_reset_requested(
        email: impl Into<String>,
        name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        AppEvent::UserPasswordResetRequested {
            email: email.into(),
            name: name.into(),
            token: token.into(),
            timestamp: Utc::now(),
        }
    }
}
