pub mod config;
pub mod connectivity;
pub mod error;
pub mod models;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod sync;

// Re-export commonly used types
pub use config::{Config, State};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, HttpProbe, NetworkProbe};
pub use error::{Result, SyncError};
pub use models::{
    CurrentUser, MutationKind, MutationStatus, Payload, PendingMutation, PushSubscription,
    ReminderStatus, ReminderTask,
};
pub use notify::{Notification, NotificationDispatcher, NotificationPlatform, PermissionState};
pub use queue::MutationQueue;
pub use remote::{HttpRemoteStore, NotificationApiClient, RemoteStore, SubscriptionStore};
pub use scheduler::ReminderScheduler;
pub use session::{AuthProvider, StateAuthProvider};
pub use sync::{DrainReport, MutationEvent, RetryPolicy, SubmitOutcome, SyncContext, SyncEngine};
