use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Completed,
    Missed,
}

/// Follow-up task owned by the remote store. The core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderTask {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: ReminderStatus,
}

impl ReminderTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReminderStatus::Pending && self.scheduled_at <= now
    }

    /// Notification tag, so repeated displays replace each other on the platform.
    pub fn tag(&self) -> String {
        format!("reminder-{}", self.id)
    }
}
