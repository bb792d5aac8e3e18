//! Notification permission, local display and push subscription lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::models::PushSubscription;
use crate::remote::SubscriptionStore;
use crate::session::AuthProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    /// Never asked
    #[default]
    Default,
    Granted,
    Denied,
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PermissionState::Default => "default",
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Notifications sharing a tag replace each other
    pub tag: Option<String>,
}

/// The host's notification and push capabilities.
#[async_trait]
pub trait NotificationPlatform: Send + Sync {
    fn permission(&self) -> PermissionState;

    /// Prompt the user. Only the dispatcher calls this.
    async fn request_permission(&self) -> Result<PermissionState>;

    fn show(&self, notification: &Notification) -> Result<()>;

    /// Subscription issued by the platform push service, if push is available.
    async fn push_subscription(&self) -> Result<Option<PushSubscription>>;

    /// Drop the current subscription, returning it if there was one.
    async fn drop_push_subscription(&self) -> Result<Option<PushSubscription>>;

    fn set_badge(&self, count: usize) -> Result<()>;
}

pub struct NotificationDispatcher {
    platform: Arc<dyn NotificationPlatform>,
    subscriptions: Arc<dyn SubscriptionStore>,
    auth: Arc<dyn AuthProvider>,
    auto_request: bool,
    auto_requested: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(
        platform: Arc<dyn NotificationPlatform>,
        subscriptions: Arc<dyn SubscriptionStore>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            platform,
            subscriptions,
            auth,
            auto_request: true,
            auto_requested: AtomicBool::new(false),
        }
    }

    /// Disable the automatic prompt; explicit requests still work.
    pub fn with_auto_request(mut self, enabled: bool) -> Self {
        self.auto_request = enabled;
        self
    }

    pub fn permission(&self) -> PermissionState {
        self.platform.permission()
    }

    /// Ask for permission. A denied state is final: the user is told how to
    /// change it and the platform is not prompted again.
    pub async fn request_permission(&self) -> PermissionState {
        match self.platform.permission() {
            PermissionState::Granted => PermissionState::Granted,
            PermissionState::Denied => {
                info!(
                    "Notifications are blocked; enable them in the system notification settings"
                );
                PermissionState::Denied
            }
            PermissionState::Default => match self.platform.request_permission().await {
                Ok(state) => {
                    info!("Notification permission: {state}");
                    state
                }
                Err(e) => {
                    warn!("Permission request failed: {e}");
                    self.platform.permission()
                }
            },
        }
    }

    /// Prompt at most once per session, and only from the default state.
    pub async fn ensure_permission(&self) -> PermissionState {
        let state = self.platform.permission();
        if state != PermissionState::Default || !self.auto_request {
            return state;
        }
        if self.auto_requested.swap(true, Ordering::SeqCst) {
            return state;
        }
        self.request_permission().await
    }

    /// Show a local notification. Without permission this does nothing.
    /// Returns whether the notification was shown.
    pub fn notify(&self, title: &str, body: &str, tag: Option<&str>) -> bool {
        if self.platform.permission() != PermissionState::Granted {
            debug!("Notification permission not granted, dropping \"{title}\"");
            return false;
        }
        let notification = Notification {
            title: title.to_string(),
            body: body.to_string(),
            tag: tag.map(str::to_string),
        };
        match self.platform.show(&notification) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to show notification \"{title}\": {e}");
                false
            }
        }
    }

    pub fn set_badge(&self, count: usize) {
        if let Err(e) = self.platform.set_badge(count) {
            debug!("Badge update failed: {e}");
        }
    }

    /// Register this device for push and persist the subscription remotely.
    pub async fn subscribe(&self) -> Result<PushSubscription> {
        let user = self
            .auth
            .current_user()
            .ok_or_else(|| SyncError::Unauthorized("sign in to enable push".into()))?;
        if self.ensure_permission().await != PermissionState::Granted {
            return Err(SyncError::PermissionDenied(
                "notification permission not granted".into(),
            ));
        }
        let subscription = self
            .platform
            .push_subscription()
            .await?
            .ok_or_else(|| SyncError::PermissionDenied("push is not available".into()))?;
        self.subscriptions
            .upsert_subscription(&user.id, &subscription)
            .await?;
        info!("Push subscription registered for {}", subscription.endpoint);
        Ok(subscription)
    }

    /// Drop this device's push subscription. Returns false if there was none.
    pub async fn unsubscribe(&self) -> Result<bool> {
        let user = self
            .auth
            .current_user()
            .ok_or_else(|| SyncError::Unauthorized("no active session".into()))?;
        let Some(subscription) = self.platform.drop_push_subscription().await? else {
            return Ok(false);
        };
        self.subscriptions
            .delete_subscription(&user.id, &subscription.endpoint)
            .await?;
        info!("Push subscription removed for {}", subscription.endpoint);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CurrentUser, PushKeys};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakePlatform {
        state: Mutex<PermissionState>,
        answer: PermissionState,
        prompts: AtomicUsize,
        shown: Mutex<Vec<Notification>>,
        subscribed: Mutex<Option<PushSubscription>>,
    }

    impl FakePlatform {
        fn new(state: PermissionState, answer: PermissionState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                answer,
                prompts: AtomicUsize::new(0),
                shown: Mutex::new(Vec::new()),
                subscribed: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl NotificationPlatform for FakePlatform {
        fn permission(&self) -> PermissionState {
            *self.state.lock().unwrap()
        }

        async fn request_permission(&self) -> Result<PermissionState> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = self.answer;
            Ok(self.answer)
        }

        fn show(&self, notification: &Notification) -> Result<()> {
            self.shown.lock().unwrap().push(notification.clone());
            Ok(())
        }

        async fn push_subscription(&self) -> Result<Option<PushSubscription>> {
            let sub = PushSubscription {
                endpoint: "https://push.example.com/device-1".into(),
                keys: PushKeys {
                    p256dh: "p".into(),
                    auth: "a".into(),
                },
            };
            *self.subscribed.lock().unwrap() = Some(sub.clone());
            Ok(Some(sub))
        }

        async fn drop_push_subscription(&self) -> Result<Option<PushSubscription>> {
            Ok(self.subscribed.lock().unwrap().take())
        }

        fn set_badge(&self, _count: usize) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemorySubscriptions(Mutex<HashMap<(String, String), PushSubscription>>);

    #[async_trait]
    impl SubscriptionStore for MemorySubscriptions {
        async fn upsert_subscription(&self, user_id: &str, sub: &PushSubscription) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .insert((user_id.into(), sub.endpoint.clone()), sub.clone());
            Ok(())
        }

        async fn delete_subscription(&self, user_id: &str, endpoint: &str) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .remove(&(user_id.to_string(), endpoint.to_string()));
            Ok(())
        }
    }

    struct SignedIn;

    impl AuthProvider for SignedIn {
        fn current_user(&self) -> Option<CurrentUser> {
            Some(CurrentUser {
                id: "u1".into(),
                role: "telecaller".into(),
                email: None,
            })
        }

        fn access_token(&self) -> Option<String> {
            Some("jwt".into())
        }

        fn sign_out(&self) {}
    }

    fn dispatcher(
        platform: Arc<FakePlatform>,
    ) -> (NotificationDispatcher, Arc<MemorySubscriptions>) {
        let subs = Arc::new(MemorySubscriptions::default());
        (
            NotificationDispatcher::new(platform, subs.clone(), Arc::new(SignedIn)),
            subs,
        )
    }

    #[tokio::test]
    async fn denied_is_never_prompted() {
        let platform = FakePlatform::new(PermissionState::Denied, PermissionState::Granted);
        let (dispatcher, _) = dispatcher(platform.clone());

        assert_eq!(dispatcher.ensure_permission().await, PermissionState::Denied);
        assert_eq!(dispatcher.request_permission().await, PermissionState::Denied);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_prompt_happens_once_per_session() {
        let platform = FakePlatform::new(PermissionState::Default, PermissionState::Default);
        let (dispatcher, _) = dispatcher(platform.clone());

        dispatcher.ensure_permission().await;
        dispatcher.ensure_permission().await;
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notify_without_permission_is_silent() {
        let platform = FakePlatform::new(PermissionState::Default, PermissionState::Granted);
        let (dispatcher, _) = dispatcher(platform.clone());

        assert!(!dispatcher.notify("Follow up", "Call Asha", Some("reminder-r1")));
        assert!(platform.shown.lock().unwrap().is_empty());

        dispatcher.request_permission().await;
        assert!(dispatcher.notify("Follow up", "Call Asha", Some("reminder-r1")));
        let shown = platform.shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].tag.as_deref(), Some("reminder-r1"));
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_round_trip_the_store() {
        let platform = FakePlatform::new(PermissionState::Granted, PermissionState::Granted);
        let (dispatcher, subs) = dispatcher(platform);

        let sub = dispatcher.subscribe().await.unwrap();
        // Re-subscribing the same endpoint upserts
        dispatcher.subscribe().await.unwrap();
        assert_eq!(subs.0.lock().unwrap().len(), 1);
        assert!(subs
            .0
            .lock()
            .unwrap()
            .contains_key(&("u1".to_string(), sub.endpoint.clone())));

        assert!(dispatcher.unsubscribe().await.unwrap());
        assert!(subs.0.lock().unwrap().is_empty());
        assert!(!dispatcher.unsubscribe().await.unwrap());
    }

    #[tokio::test]
    async fn subscribe_requires_permission() {
        let platform = FakePlatform::new(PermissionState::Denied, PermissionState::Granted);
        let (dispatcher, subs) = dispatcher(platform);
        let err = dispatcher.subscribe().await.unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied(_)));
        assert!(subs.0.lock().unwrap().is_empty());
    }
}
