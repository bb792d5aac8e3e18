use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use leadline_core::config::{Config, State};
use leadline_core::{
    AuthProvider, ConnectivityMonitor, HttpProbe, HttpRemoteStore, MutationEvent, MutationQueue,
    NetworkProbe, NotificationApiClient, NotificationDispatcher, ReminderScheduler,
    StateAuthProvider, SyncContext, SyncEngine,
};
use leadline_proto::RealtimeMessage;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignments::{self, AssignmentFeed};
use crate::platform::DesktopPlatform;

/// Everything the daemon and the one-shot commands share.
pub struct Services {
    pub config: Config,
    pub auth: Arc<StateAuthProvider>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub probe: Arc<dyn NetworkProbe>,
    pub engine: Arc<SyncEngine>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub scheduler: Arc<ReminderScheduler>,
}

impl Services {
    pub async fn build(config: Config, state: State, state_path: PathBuf) -> Result<Self> {
        let base_url = config
            .remote
            .base_url
            .clone()
            .context("remote.base_url is not configured")?;

        let permission = state.notifications.permission;
        let auth = Arc::new(StateAuthProvider::new(state, Some(state_path.clone())));
        let remote = Arc::new(HttpRemoteStore::new(
            base_url.clone(),
            config.remote.api_key.clone(),
            auth.clone(),
        )?);

        let database_path = config.database_path()?;
        let queue = Arc::new(
            MutationQueue::open(&database_path)
                .with_context(|| format!("Failed to open {}", database_path.display()))?
                .with_max_len(config.sync.max_queue_len),
        );

        let probe_url = config.probe_url().unwrap_or_else(|| base_url.clone());
        let probe: Arc<dyn NetworkProbe> = Arc::new(HttpProbe::new(
            probe_url,
            Duration::from_millis(config.sync.probe_timeout_ms),
        )?);
        let monitor = Arc::new(
            ConnectivityMonitor::sample(probe.as_ref())
                .await
                .with_debounce(Duration::from_millis(config.sync.debounce_ms)),
        );

        let ctx = SyncContext::new(queue, monitor.state());
        let engine = Arc::new(
            SyncEngine::new(ctx.clone(), remote.clone(), config.retry_policy())
                .with_claim_timeout(Duration::from_secs(config.sync.claim_timeout_secs)),
        );
        engine.recover()?;

        let push = config
            .notifications
            .push
            .as_ref()
            .map(|push| push.to_subscription());
        let platform = Arc::new(DesktopPlatform::new(permission, Some(state_path), push));
        let notifications_url = config
            .remote
            .notifications_url
            .clone()
            .unwrap_or(base_url);
        let subscriptions = Arc::new(NotificationApiClient::new(notifications_url, auth.clone()));
        let dispatcher = Arc::new(
            NotificationDispatcher::new(platform, subscriptions, auth.clone())
                .with_auto_request(config.notifications.auto_request_permission),
        );

        let scheduler = Arc::new(
            ReminderScheduler::new(ctx, remote, auth.clone(), dispatcher.clone())
                .with_interval(Duration::from_secs(config.reminders.interval_seconds.max(1))),
        );

        Ok(Self {
            config,
            auth,
            monitor,
            probe,
            engine,
            dispatcher,
            scheduler,
        })
    }
}

/// Run until ctrl-c: drain on reconnect and on an interval, poll reminders,
/// and surface lead assignments.
pub async fn run(services: Services) -> Result<()> {
    let Services {
        config,
        auth,
        monitor,
        probe,
        engine,
        dispatcher,
        scheduler,
    } = services;
    let cancel = CancellationToken::new();

    if auth.current_user().is_none() {
        warn!("No signed-in user; mutations will queue until a session is stored");
    }
    dispatcher.ensure_permission().await;

    {
        let monitor = monitor.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_secs(config.sync.probe_interval_secs.max(1));
        tokio::spawn(async move { monitor.watch_probe(probe, interval, cancel).await });
    }

    let drain_task = {
        let engine = engine.clone();
        let triggers = monitor.drain_triggers(cancel.clone());
        let cancel = cancel.clone();
        let interval = Duration::from_secs(config.sync.interval_seconds.max(1));
        tokio::spawn(async move { engine.run(triggers, interval, cancel).await })
    };

    spawn_event_listener(&engine, dispatcher.clone(), cancel.clone());

    if config.reminders.enabled {
        scheduler.start().await;
    }

    let realtime_url = config
        .remote
        .realtime_url
        .clone()
        .or_else(|| config.remote.notifications_url.clone());
    let mut feed = match realtime_url {
        Some(url) => Some(AssignmentFeed::spawn(url, auth.clone(), cancel.clone())),
        None => {
            debug!("No realtime URL configured");
            None
        }
    };

    info!("leadline-syncd running");
    loop {
        tokio::select! {
            message = next_message(&mut feed) => match message {
                Some(message) => handle_realtime(message, &dispatcher, &scheduler).await,
                None => {
                    debug!("Realtime feed closed");
                    feed = None;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, stopping leadline-syncd");
                break;
            }
        }
    }

    cancel.cancel();
    scheduler.stop().await;
    if let Err(e) = drain_task.await {
        error!("Drain task ended abnormally: {e}");
    }
    Ok(())
}

async fn next_message(feed: &mut Option<AssignmentFeed>) -> Option<RealtimeMessage> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_realtime(
    message: RealtimeMessage,
    dispatcher: &NotificationDispatcher,
    scheduler: &ReminderScheduler,
) {
    if let Some((title, body, tag)) = assignments::describe(&message) {
        dispatcher.notify(&title, &body, Some(&tag));
        return;
    }
    if let RealtimeMessage::ReminderChanged { reminder_id } = message {
        debug!("Reminder {reminder_id} changed, polling now");
        if let Err(e) = scheduler.tick().await {
            warn!("Reminder poll failed: {e}");
        }
    }
}

/// Tell the user when a queued write is given up on.
fn spawn_event_listener(
    engine: &SyncEngine,
    dispatcher: Arc<NotificationDispatcher>,
    cancel: CancellationToken,
) {
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(MutationEvent::Failed { id, reason }) => {
                    dispatcher.notify(
                        "A change could not be synced",
                        &reason,
                        Some(&format!("sync-{id}")),
                    );
                }
                Ok(MutationEvent::Synced { id, remote_id }) => {
                    debug!("Mutation {id} synced as {remote_id:?}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Event listener skipped {skipped} event(s)");
                }
                Err(RecvError::Closed) => return,
            }
        }
    });
}
