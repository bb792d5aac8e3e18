//! Sync engine: optimistic submission and queue draining.
//!
//! Writes go straight to the remote store while online. Anything that cannot
//! be delivered right now lands in the [`MutationQueue`] and is replayed in
//! FIFO order by [`SyncEngine::drain`] once connectivity returns.

mod retry;

pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connectivity::ConnectivityState;
use crate::error::{Result, SyncError};
use crate::models::{MutationKind, MutationStatus, Payload, PendingMutation};
use crate::queue::MutationQueue;
use crate::remote::RemoteStore;

/// Process-wide state shared by the sync engine and the reminder scheduler.
///
/// The connectivity handle is read-only; only the monitor that produced it
/// can change the flag.
#[derive(Clone)]
pub struct SyncContext {
    pub queue: Arc<MutationQueue>,
    pub connectivity: ConnectivityState,
}

impl SyncContext {
    pub fn new(queue: Arc<MutationQueue>, connectivity: ConnectivityState) -> Self {
        Self {
            queue,
            connectivity,
        }
    }
}

/// How a submission was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Written to the remote store; carries the remote row
    Remote(Value),
    /// Recorded locally for a later drain
    Queued { local_id: String },
}

impl SubmitOutcome {
    pub fn is_offline(&self) -> bool {
        matches!(self, SubmitOutcome::Queued { .. })
    }
}

/// Status changes of queued mutations, for observers such as a pending badge.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    Queued {
        id: String,
        kind: MutationKind,
    },
    Syncing {
        id: String,
    },
    Synced {
        id: String,
        remote_id: Option<String>,
    },
    Retrying {
        id: String,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        reason: String,
    },
    Failed {
        id: String,
        reason: String,
    },
}

/// Summary of one drain pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    /// Mutations put back for another attempt
    pub retried: usize,
    /// Mutations that became terminally failed
    pub failed: usize,
    /// Pending mutations the pass did not reach
    pub deferred: usize,
}

impl DrainReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// What the id references of a payload resolve to.
enum Resolution {
    Ready(Payload),
    /// A referenced entity has not reached the remote store yet
    Waiting(String),
    /// A referenced entity will never reach the remote store
    Orphaned(String),
}

const EVENT_CAPACITY: usize = 256;

/// How long another process may hold a claim before it is presumed dead.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// What the drain pass does after one mutation.
enum Step {
    Next,
    /// Stop; the mutation was settled as retried or failed
    Halt,
    /// Stop; the mutation went back to pending untouched
    Held,
}

pub struct SyncEngine {
    ctx: SyncContext,
    remote: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    claim_timeout: Duration,
    drain_lock: Mutex<()>,
    events: broadcast::Sender<MutationEvent>,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext, remote: Arc<dyn RemoteStore>, policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ctx,
            remote,
            policy,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            drain_lock: Mutex::new(()),
            events,
        }
    }

    /// Claims older than `timeout` held by other processes are reclaimed.
    /// Keep it well above the remote store's request timeout.
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.ctx.queue
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MutationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MutationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Put mutations stranded in `syncing` by a crashed process back in line.
    /// Claims younger than the claim timeout are left to their owner.
    pub fn recover(&self) -> Result<usize> {
        let recovered = self.ctx.queue.recover_in_flight(self.claim_timeout)?;
        if recovered > 0 {
            warn!("Recovered {recovered} mutation(s) interrupted mid-sync");
        }
        Ok(recovered)
    }

    /// Write `payload`, or queue it when the remote store cannot be reached.
    ///
    /// Connectivity problems never surface as errors: they resolve to
    /// [`SubmitOutcome::Queued`]. Validation, conflict and session errors are
    /// returned to the caller and nothing is queued.
    pub async fn submit(&self, kind: MutationKind, payload: Payload) -> Result<SubmitOutcome> {
        kind.validate(&payload)?;

        if !self.ctx.connectivity.is_online() {
            return self.enqueue(kind, payload);
        }

        let resolved = match self.resolve_references(kind, &payload)? {
            Resolution::Ready(resolved) => resolved,
            Resolution::Waiting(local_id) => {
                debug!("{kind} references unsynced entity {local_id}, queueing");
                return self.enqueue(kind, payload);
            }
            Resolution::Orphaned(local_id) => {
                return Err(SyncError::Validation(format!(
                    "references {local_id}, which failed to sync"
                )));
            }
        };

        match self.remote.write(kind, &resolved).await {
            Ok(row) => Ok(SubmitOutcome::Remote(row)),
            Err(e) if e.is_retryable() => {
                warn!("Live write of {kind} failed ({e}), queueing for later");
                self.enqueue(kind, payload)
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue(&self, kind: MutationKind, payload: Payload) -> Result<SubmitOutcome> {
        let local_id = self.ctx.queue.enqueue(kind, payload)?;
        self.emit(MutationEvent::Queued {
            id: local_id.clone(),
            kind,
        });
        Ok(SubmitOutcome::Queued { local_id })
    }

    /// Substitute remote ids for local ids of entities created offline.
    fn resolve_references(&self, kind: MutationKind, payload: &Payload) -> Result<Resolution> {
        let mut resolved = payload.clone();
        for field in kind.reference_fields() {
            let Some(Value::String(reference)) = payload.get(*field) else {
                continue;
            };
            if let Some(remote_id) = self.ctx.queue.resolve_id(reference)? {
                resolved.insert((*field).to_string(), Value::String(remote_id));
                continue;
            }
            let Some(creator) = self.ctx.queue.get(reference)? else {
                continue;
            };
            if !creator.kind.creates_entity() {
                continue;
            }
            return Ok(match creator.status {
                MutationStatus::Failed => Resolution::Orphaned(creator.id),
                _ => Resolution::Waiting(creator.id),
            });
        }
        Ok(Resolution::Ready(resolved))
    }

    /// Replay pending mutations in FIFO order.
    ///
    /// Only one pass runs at a time; a concurrent call waits for the running
    /// pass and then drains whatever is still pending. A retryable failure
    /// stops the pass so later mutations never overtake an earlier one.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _pass = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        if !self.ctx.connectivity.is_online() {
            debug!("Offline, skipping drain");
            return Ok(report);
        }

        self.recover()?;
        let pending = self.ctx.queue.list(Some(MutationStatus::Pending))?;
        if pending.is_empty() {
            return Ok(report);
        }
        info!("Draining {} pending mutation(s)", pending.len());

        let now = Utc::now();
        for (index, mutation) in pending.iter().enumerate() {
            let remaining = pending.len() - index;
            if !self.ctx.connectivity.is_online() {
                info!("Connectivity lost mid-drain, {remaining} mutation(s) deferred");
                report.deferred = remaining;
                break;
            }
            if !mutation.ready_at(now) {
                debug!("{} is backing off, deferring the rest of the queue", mutation.id);
                report.deferred = remaining;
                break;
            }
            if !self.ctx.queue.mark_syncing(&mutation.id)? {
                continue;
            }
            self.emit(MutationEvent::Syncing {
                id: mutation.id.clone(),
            });

            match self.deliver(mutation, &mut report).await {
                Ok(Step::Next) => {}
                Ok(Step::Halt) => {
                    report.deferred = remaining - 1;
                    break;
                }
                Ok(Step::Held) => {
                    report.deferred = remaining;
                    break;
                }
                Err(e) => {
                    // Local storage failed; hand the claim back before bailing
                    if let Err(release_err) = self.ctx.queue.release(&mutation.id, None) {
                        error!("Failed to release {}: {release_err}", mutation.id);
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "Drain finished: {} synced, {} retrying, {} failed, {} deferred",
            report.synced, report.retried, report.failed, report.deferred
        );
        Ok(report)
    }

    /// Attempt one claimed mutation.
    async fn deliver(&self, mutation: &PendingMutation, report: &mut DrainReport) -> Result<Step> {
        let id = mutation.id.as_str();
        let payload = match self.resolve_references(mutation.kind, &mutation.payload)? {
            Resolution::Ready(payload) => payload,
            Resolution::Waiting(creator) => {
                debug!("{id} waits on {creator}");
                self.ctx.queue.release(id, None)?;
                return Ok(Step::Held);
            }
            Resolution::Orphaned(creator) => {
                self.fail(id, &format!("depends on {creator}, which failed to sync"))?;
                report.failed += 1;
                return Ok(Step::Next);
            }
        };

        match self.remote.write(mutation.kind, &payload).await {
            Ok(row) => {
                let remote_id = row.get("id").and_then(remote_id);
                if mutation.kind.creates_entity() {
                    match &remote_id {
                        Some(remote_id) => self.ctx.queue.record_mapping(id, remote_id)?,
                        None => warn!("Remote row for {id} carried no id"),
                    }
                }
                self.ctx.queue.mark_synced(id)?;
                self.ctx.queue.remove(id)?;
                debug!("Synced {} {id}", mutation.kind);
                self.emit(MutationEvent::Synced {
                    id: id.to_string(),
                    remote_id,
                });
                report.synced += 1;
                Ok(Step::Next)
            }
            Err(SyncError::Unauthorized(reason)) => {
                warn!("Session rejected while draining: {reason}");
                self.ctx.queue.release(id, Some(&reason))?;
                Ok(Step::Held)
            }
            Err(e) if e.is_retryable() => {
                let attempts = mutation.attempts + 1;
                let reason = e.to_string();
                if self.policy.exhausted(attempts) {
                    self.fail(id, &reason)?;
                    report.failed += 1;
                } else {
                    let delay = self.policy.delay_for(attempts);
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    self.ctx.queue.mark_retry(id, &reason, next_attempt_at)?;
                    warn!(
                        "Attempt {attempts}/{} for {id} failed: {reason}",
                        self.policy.max_attempts
                    );
                    self.emit(MutationEvent::Retrying {
                        id: id.to_string(),
                        attempts,
                        next_attempt_at,
                        reason,
                    });
                    report.retried += 1;
                }
                Ok(Step::Halt)
            }
            Err(e) => {
                self.fail(id, &e.to_string())?;
                report.failed += 1;
                Ok(Step::Next)
            }
        }
    }

    fn fail(&self, id: &str, reason: &str) -> Result<()> {
        self.ctx.queue.mark_failed(id, reason)?;
        error!("Mutation {id} failed: {reason}");
        self.emit(MutationEvent::Failed {
            id: id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Give a terminally failed mutation a fresh attempt budget.
    pub fn retry_failed(&self, id: &str) -> Result<bool> {
        let Some(mutation) = self.ctx.queue.get(id)? else {
            return Ok(false);
        };
        if !self.ctx.queue.reset_failed(id)? {
            return Ok(false);
        }
        info!("Re-queued failed mutation {id}");
        self.emit(MutationEvent::Queued {
            id: id.to_string(),
            kind: mutation.kind,
        });
        Ok(true)
    }

    /// Drop a mutation the user gave up on. In-flight mutations cannot be discarded.
    pub fn discard(&self, id: &str) -> Result<bool> {
        match self.ctx.queue.get(id)? {
            None => Ok(false),
            Some(m) if m.status == MutationStatus::Syncing => Err(SyncError::Validation(format!(
                "mutation {id} is being synced"
            ))),
            Some(_) => {
                let removed = self.ctx.queue.remove(id)?;
                if removed {
                    info!("Discarded mutation {id}");
                }
                Ok(removed)
            }
        }
    }

    /// Mutations still waiting to reach the remote store.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.ctx.queue.count(Some(MutationStatus::Pending))?
            + self.ctx.queue.count(Some(MutationStatus::Syncing))?)
    }

    /// Drain on every trigger and on a fixed interval until cancelled.
    ///
    /// Drain errors are logged and the loop keeps running.
    pub async fn run(
        &self,
        mut triggers: mpsc::Receiver<()>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        debug!("Drain trigger stream closed");
                        break;
                    }
                    debug!("Connectivity restored, draining");
                }
                _ = ticker.tick() => {
                    debug!("Performing periodic drain");
                }
            }
            if let Err(e) = self.drain().await {
                error!("Drain failed: {e}");
            }
        }
    }
}

fn remote_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
