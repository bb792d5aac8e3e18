//! Recurring poll for due follow-up reminders.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::models::ReminderTask;
use crate::notify::NotificationDispatcher;
use crate::remote::RemoteStore;
use crate::session::AuthProvider;
use crate::sync::SyncContext;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Poller {
    ctx: SyncContext,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    dispatcher: Arc<NotificationDispatcher>,
    /// Task ids already notified in this process lifetime
    notified: std::sync::Mutex<HashSet<String>>,
}

pub struct ReminderScheduler {
    poller: Arc<Poller>,
    ticker: Mutex<Option<Ticker>>,
    interval: Duration,
}

impl ReminderScheduler {
    pub fn new(
        ctx: SyncContext,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            poller: Arc::new(Poller {
                ctx,
                remote,
                auth,
                dispatcher,
                notified: std::sync::Mutex::new(HashSet::new()),
            }),
            ticker: Mutex::new(None),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn is_running(&self) -> bool {
        self.ticker.lock().await.is_some()
    }

    /// Start polling. The first poll runs immediately. Starting a running
    /// scheduler does nothing.
    pub async fn start(&self) {
        let mut guard = self.ticker.lock().await;
        if guard.is_some() {
            debug!("Reminder scheduler already running");
            return;
        }

        let cancel = CancellationToken::new();
        let poller = self.poller.clone();
        let period = self.interval;
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = poller.poll().await {
                            warn!("Reminder poll failed: {e}");
                        }
                    }
                }
            }
        });

        info!("Reminder scheduler started ({}s interval)", period.as_secs());
        *guard = Some(Ticker { cancel, handle });
    }

    /// Stop polling and forget which tasks were notified. A poll that is
    /// already running finishes before this returns.
    pub async fn stop(&self) {
        let ticker = self.ticker.lock().await.take();
        if let Some(Ticker { cancel, handle }) = ticker {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Reminder ticker ended abnormally: {e}");
            }
            info!("Reminder scheduler stopped");
        }
        self.poller.notified_set().clear();
    }

    /// Run one poll now. Returns how many notifications were dispatched.
    pub async fn tick(&self) -> Result<usize> {
        self.poller.poll().await
    }
}

impl Poller {
    fn notified_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.notified.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pending reminders from the remote store, or the local cache when it
    /// cannot be reached.
    async fn pending(&self, user_id: &str) -> Result<Vec<ReminderTask>> {
        if !self.ctx.connectivity.is_online() {
            return self.ctx.queue.cached_reminders(user_id);
        }
        match self.remote.pending_reminders(user_id).await {
            Ok(tasks) => {
                if let Err(e) = self.ctx.queue.cache_reminders(user_id, &tasks) {
                    warn!("Failed to cache reminders: {e}");
                }
                Ok(tasks)
            }
            Err(SyncError::Network(reason)) => {
                debug!("Reminder fetch failed ({reason}), using cache");
                self.ctx.queue.cached_reminders(user_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn poll(&self) -> Result<usize> {
        let Some(user) = self.auth.current_user() else {
            debug!("No signed-in user, skipping reminder poll");
            return Ok(0);
        };

        let now = Utc::now();
        let due: Vec<ReminderTask> = self
            .pending(&user.id)
            .await?
            .into_iter()
            .filter(|task| task.is_due(now))
            .collect();
        self.dispatcher.set_badge(due.len());

        let fresh: Vec<ReminderTask> = {
            let notified = self.notified_set();
            due.into_iter()
                .filter(|task| !notified.contains(&task.id))
                .collect()
        };
        let mut shown = 0;
        for task in &fresh {
            let body = match &task.notes {
                Some(notes) if !notes.trim().is_empty() => notes.clone(),
                _ => format!(
                    "Scheduled for {}",
                    task.scheduled_at.format("%Y-%m-%d %H:%M UTC")
                ),
            };
            // Only shown tasks count, so a later grant still surfaces the rest
            if self.dispatcher.notify(&task.title, &body, Some(&task.tag())) {
                self.notified_set().insert(task.id.clone());
                shown += 1;
            }
        }
        if shown > 0 {
            info!("Dispatched {shown} reminder notification(s)");
        }
        Ok(shown)
    }
}
