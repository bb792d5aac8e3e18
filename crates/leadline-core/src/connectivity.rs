//! Online/offline tracking.
//!
//! The monitor owns the only `watch::Sender` for the flag, so every other
//! component holds a read-only [`ConnectivityState`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Samples the platform's network signal.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Treats any HTTP response from `url` as "online".
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NetworkProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Connectivity probe to {} failed: {e}", self.url);
                false
            }
        }
    }
}

/// Read-only handle on the process-wide connectivity flag.
#[derive(Clone, Debug)]
pub struct ConnectivityState {
    rx: watch::Receiver<bool>,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

type Listener = Box<dyn Fn(bool) + Send + Sync>;

pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    debounce: Duration,
}

/// Default window in which flaps collapse into one drain trigger
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1_500);

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self {
            tx,
            listeners: Arc::new(Mutex::new(Vec::new())),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Build a monitor whose initial value comes from one probe sample.
    pub async fn sample(probe: &dyn NetworkProbe) -> Self {
        let online = probe.is_reachable().await;
        info!(
            "Initial connectivity: {}",
            if online { "online" } else { "offline" }
        );
        Self::new(online)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Register a listener called on every transition. Listeners run inline and
    /// must not register further listeners.
    pub fn on_change(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        match self.listeners.lock() {
            Ok(mut guard) => guard.push(Box::new(listener)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(listener)),
        }
    }

    /// Entry point for platform network events.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        if online {
            info!("Connectivity restored");
        } else {
            warn!("Connectivity lost");
        }
        let listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for listener in listeners.iter() {
            listener(online);
        }
    }

    /// Stream of drain triggers: one per settled offline→online transition.
    ///
    /// Transitions are collected until the flag has been quiet for the debounce
    /// window; the burst yields a single trigger if it ends online and went
    /// through offline.
    pub fn drain_triggers(&self, cancel: CancellationToken) -> mpsc::Receiver<()> {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let mut rx = self.tx.subscribe();
        let mut settled = *rx.borrow_and_update();
        let debounce = self.debounce;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                let mut saw_offline = !settled || !*rx.borrow_and_update();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if !*rx.borrow_and_update() {
                                saw_offline = true;
                            }
                        }
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }

                let online = *rx.borrow();
                if online && saw_offline {
                    debug!("Connectivity settled online, requesting drain");
                    // A full channel already holds an undelivered trigger
                    if let Err(mpsc::error::TrySendError::Closed(_)) = trigger_tx.try_send(()) {
                        return;
                    }
                }
                settled = online;
            }
        });

        trigger_rx
    }

    /// Sample `probe` every `interval` until cancelled, publishing transitions.
    pub async fn watch_probe(
        &self,
        probe: Arc<dyn NetworkProbe>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let online = probe.is_reachable().await;
                    self.set_online(online);
                }
            }
        }
    }
}
