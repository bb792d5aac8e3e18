pub mod mutation;
pub mod reminder;

pub use leadline_proto::{PushKeys, PushSubscriptionPayload as PushSubscription};
pub use mutation::{MutationKind, MutationStatus, Payload, PendingMutation};
pub use reminder::{ReminderStatus, ReminderTask};

use serde::{Deserialize, Serialize};

/// The signed-in user as reported by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    /// Drives UI routing only
    pub role: String,
    #[serde(default)]
    pub email: Option<String>,
}
