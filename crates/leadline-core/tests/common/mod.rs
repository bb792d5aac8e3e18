#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use leadline_core::{
    AuthProvider, ConnectivityMonitor, CurrentUser, MutationKind, MutationQueue, Notification,
    NotificationDispatcher, NotificationPlatform, Payload, PermissionState, PushSubscription,
    ReminderStatus, ReminderTask, RemoteStore, Result, RetryPolicy, SubscriptionStore, SyncContext,
    SyncEngine, SyncError,
};

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

pub fn lead(name: &str) -> Payload {
    payload(json!({ "name": name, "phone": "+91 98450 12345" }))
}

pub fn due_task(id: &str) -> ReminderTask {
    ReminderTask {
        id: id.into(),
        user_id: "u1".into(),
        lead_id: Some("L-1".into()),
        title: format!("Follow up {id}"),
        notes: None,
        scheduled_at: Utc::now() - chrono::Duration::minutes(5),
        status: ReminderStatus::Pending,
    }
}

/// Remote store double that records writes in arrival order.
#[derive(Default)]
pub struct FakeRemote {
    pub writes: Mutex<Vec<(MutationKind, Payload)>>,
    failures: Mutex<VecDeque<SyncError>>,
    write_delay: Mutex<Option<Duration>>,
    reminder_script: Mutex<VecDeque<Result<Vec<ReminderTask>>>>,
    default_reminders: Mutex<Vec<ReminderTask>>,
    pub reminder_calls: AtomicUsize,
}

impl FakeRemote {
    /// The next write fails with `error`.
    pub fn fail_next(&self, error: SyncError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    /// Reply to the next reminder fetch with `result`.
    pub fn script_reminders(&self, result: Result<Vec<ReminderTask>>) {
        self.reminder_script.lock().unwrap().push_back(result);
    }

    /// Reply to unscripted reminder fetches with `tasks`.
    pub fn set_reminders(&self, tasks: Vec<ReminderTask>) {
        *self.default_reminders.lock().unwrap() = tasks;
    }

    pub fn written(&self) -> Vec<(MutationKind, Payload)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn write(&self, kind: MutationKind, payload: &Payload) -> Result<Value> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = {
            let mut writes = self.writes.lock().unwrap();
            writes.push((kind, payload.clone()));
            writes.len()
        };
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut row = payload.clone();
        row.insert("id".into(), json!(format!("srv-{n}")));
        Ok(Value::Object(row))
    }

    async fn pending_reminders(&self, _user_id: &str) -> Result<Vec<ReminderTask>> {
        self.reminder_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.reminder_script.lock().unwrap().pop_front() {
            return result;
        }
        Ok(self.default_reminders.lock().unwrap().clone())
    }
}

pub struct FakePlatform {
    state: Mutex<PermissionState>,
    answer: PermissionState,
    pub prompts: AtomicUsize,
    pub shown: Mutex<Vec<Notification>>,
}

impl FakePlatform {
    pub fn new(state: PermissionState, answer: PermissionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            answer,
            prompts: AtomicUsize::new(0),
            shown: Mutex::new(Vec::new()),
        })
    }

    pub fn granted() -> Arc<Self> {
        Self::new(PermissionState::Granted, PermissionState::Granted)
    }

    pub fn shown_count(&self) -> usize {
        self.shown.lock().unwrap().len()
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
        Ok(None)
    }

    async fn drop_push_subscription(&self) -> Result<Option<PushSubscription>> {
        Ok(None)
    }

    fn set_badge(&self, _count: usize) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySubscriptions(pub Mutex<HashMap<(String, String), PushSubscription>>);

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

pub struct SignedIn;

impl AuthProvider for SignedIn {
    fn current_user(&self) -> Option<CurrentUser> {
        Some(CurrentUser {
            id: "u1".into(),
            role: "telecaller".into(),
            email: Some("caller@example.com".into()),
        })
    }

    fn access_token(&self) -> Option<String> {
        Some("jwt".into())
    }

    fn sign_out(&self) {}
}

pub struct Harness {
    pub monitor: ConnectivityMonitor,
    pub queue: Arc<MutationQueue>,
    pub remote: Arc<FakeRemote>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new(online: bool, policy: RetryPolicy) -> Self {
        let monitor = ConnectivityMonitor::new(online);
        let queue = Arc::new(MutationQueue::open_in_memory().expect("open queue"));
        let remote = Arc::new(FakeRemote::default());
        let engine = Arc::new(SyncEngine::new(
            SyncContext::new(queue.clone(), monitor.state()),
            remote.clone(),
            policy,
        ));
        Self {
            monitor,
            queue,
            remote,
            engine,
        }
    }

    pub fn context(&self) -> SyncContext {
        self.engine.context().clone()
    }

    pub fn dispatcher(&self, platform: Arc<FakePlatform>) -> Arc<NotificationDispatcher> {
        Arc::new(NotificationDispatcher::new(
            platform,
            Arc::new(MemorySubscriptions::default()),
            Arc::new(SignedIn),
        ))
    }
}
