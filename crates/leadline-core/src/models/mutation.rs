use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// Field name to value mapping carried by a mutation.
pub type Payload = Map<String, Value>;

/// Operation types that can be written to the remote store or queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateLead,
    UpdateLead,
    AddNote,
    LogCall,
    MarkAttendance,
    CompleteReminder,
}

impl MutationKind {
    pub const ALL: [MutationKind; 6] = [
        MutationKind::CreateLead,
        MutationKind::UpdateLead,
        MutationKind::AddNote,
        MutationKind::LogCall,
        MutationKind::MarkAttendance,
        MutationKind::CompleteReminder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::CreateLead => "create_lead",
            MutationKind::UpdateLead => "update_lead",
            MutationKind::AddNote => "add_note",
            MutationKind::LogCall => "log_call",
            MutationKind::MarkAttendance => "mark_attendance",
            MutationKind::CompleteReminder => "complete_reminder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Remote collection the mutation is written to.
    pub fn collection(self) -> &'static str {
        match self {
            MutationKind::CreateLead | MutationKind::UpdateLead => "leads",
            MutationKind::AddNote => "activity_logs",
            MutationKind::LogCall => "call_logs",
            MutationKind::MarkAttendance => "attendance",
            MutationKind::CompleteReminder => "follow_ups",
        }
    }

    /// Whether a successful write creates an entity whose remote id later
    /// mutations may reference by local id.
    pub fn creates_entity(self) -> bool {
        matches!(self, MutationKind::CreateLead)
    }

    /// Payload fields that may hold the local id of an entity created offline.
    pub fn reference_fields(self) -> &'static [&'static str] {
        match self {
            MutationKind::UpdateLead => &["id"],
            MutationKind::AddNote | MutationKind::LogCall => &["lead_id"],
            MutationKind::CompleteReminder => &["lead_id"],
            MutationKind::CreateLead | MutationKind::MarkAttendance => &[],
        }
    }

    /// Check the payload before it is written or queued.
    pub fn validate(self, payload: &Payload) -> Result<()> {
        match self {
            MutationKind::CreateLead => {
                require_text(payload, "name")?;
                let phone = require_text(payload, "phone")?;
                if phone.chars().filter(char::is_ascii_digit).count() < 7 {
                    return Err(invalid("phone", "must contain at least 7 digits"));
                }
                if let Some(email) = optional_text(payload, "email")? {
                    if !email.contains('@') {
                        return Err(invalid("email", "is not an email address"));
                    }
                }
            }
            MutationKind::UpdateLead => {
                require_text(payload, "id")?;
                if payload.keys().all(|k| k == "id" || k == "updated_at") {
                    return Err(SyncError::Validation(
                        "update_lead needs at least one field to change".into(),
                    ));
                }
                if let Some(seen) = optional_text(payload, "updated_at")? {
                    DateTime::parse_from_rfc3339(seen)
                        .map_err(|_| invalid("updated_at", "is not an RFC 3339 timestamp"))?;
                }
            }
            MutationKind::AddNote => {
                require_text(payload, "lead_id")?;
                require_text(payload, "note")?;
            }
            MutationKind::LogCall => {
                require_text(payload, "lead_id")?;
                require_text(payload, "outcome")?;
                if let Some(duration) = payload.get("duration_secs") {
                    if duration.as_u64().is_none() {
                        return Err(invalid("duration_secs", "must be a non-negative integer"));
                    }
                }
            }
            MutationKind::MarkAttendance => {
                require_text(payload, "user_id")?;
                let date = require_text(payload, "date")?;
                NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .map_err(|_| invalid("date", "must be YYYY-MM-DD"))?;
                require_text(payload, "status")?;
            }
            MutationKind::CompleteReminder => {
                require_text(payload, "id")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn invalid(field: &str, reason: &str) -> SyncError {
    SyncError::Validation(format!("`{field}` {reason}"))
}

fn require_text<'a>(payload: &'a Payload, field: &str) -> Result<&'a str> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) => Err(invalid(field, "must not be empty")),
        Some(_) => Err(invalid(field, "must be a string")),
        None => Err(invalid(field, "is required")),
    }
}

fn optional_text<'a>(payload: &'a Payload, field: &str) -> Result<Option<&'a str>> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(invalid(field, "must be a string")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl MutationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Syncing => "syncing",
            MutationStatus::Synced => "synced",
            MutationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MutationStatus::Pending),
            "syncing" => Some(MutationStatus::Syncing),
            "synced" => Some(MutationStatus::Synced),
            "failed" => Some(MutationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write recorded locally while offline or after a failed live write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Local id, never the eventual remote id
    pub id: String,
    pub kind: MutationKind,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub status: MutationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the next attempt may run
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
    pub fn is_terminal(&self) -> bool {
        self.status == MutationStatus::Failed
    }

    /// Whether the backoff gate allows another attempt at `now`.
    pub fn ready_at(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
