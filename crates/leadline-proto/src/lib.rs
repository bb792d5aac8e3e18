use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key material issued by the platform push service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// A push subscription in the shape browsers serialise `PushSubscription` to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscriptionPayload {
    pub endpoint: String,
    pub keys: PushKeys,
}

/// Body of `POST /api/notifications/subscribe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscription: PushSubscriptionPayload,
}

/// Body of `POST /api/notifications/unsubscribe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

/// Body of `POST /api/notifications/assign`, sent by the lead-transfer flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignLeadRequest {
    pub lead_id: String,
    pub lead_name: String,
    pub assignee_id: String,
}

/// Body of `POST /api/notifications/reminder`, sent when a follow-up task is
/// created or rescheduled for `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderChangedRequest {
    pub reminder_id: String,
    pub user_id: String,
}

/// Reply envelope shared by the notification endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// Messages pushed over the realtime feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeMessage {
    /// A lead was assigned (or transferred) to the receiving user.
    LeadAssigned {
        lead_id: String,
        lead_name: String,
        #[serde(default)]
        assigned_by: Option<String>,
        assigned_at: DateTime<Utc>,
    },
    /// A follow-up task for the receiving user was created or rescheduled.
    ReminderChanged { reminder_id: String },
}
