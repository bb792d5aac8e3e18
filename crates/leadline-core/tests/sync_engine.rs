mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{lead, payload, FakeRemote, Harness};
use leadline_core::{
    ConnectivityMonitor, MutationEvent, MutationKind, MutationQueue, MutationStatus, RetryPolicy,
    SubmitOutcome, SyncContext, SyncEngine, SyncError,
};

fn queued_id(outcome: SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Queued { local_id } => local_id,
        SubmitOutcome::Remote(row) => panic!("expected a queued outcome, got {row}"),
    }
}

#[tokio::test]
async fn drain_writes_in_enqueue_order() {
    let h = Harness::new(false, RetryPolicy::immediate(3));
    let mut ids = Vec::new();
    for n in 0..10 {
        let outcome = h
            .engine
            .submit(
                MutationKind::LogCall,
                payload(json!({ "lead_id": "L-1", "outcome": format!("call-{n}") })),
            )
            .await
            .unwrap();
        ids.push(queued_id(outcome));
    }

    h.monitor.set_online(true);
    let report = h.engine.drain().await.unwrap();
    assert_eq!(report.synced, 10);

    let outcomes: Vec<String> = h
        .remote
        .written()
        .iter()
        .map(|(_, p)| p["outcome"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|n| format!("call-{n}")).collect();
    assert_eq!(outcomes, expected);
    assert_eq!(h.engine.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn concurrent_drains_never_submit_twice() {
    let h = Harness::new(false, RetryPolicy::immediate(3));
    for n in 0..3 {
        h.engine
            .submit(
                MutationKind::AddNote,
                payload(json!({ "lead_id": "L-1", "note": format!("note {n}") })),
            )
            .await
            .unwrap();
    }
    h.monitor.set_online(true);
    h.remote.set_write_delay(Duration::from_millis(20));

    let (a, b) = tokio::join!(h.engine.drain(), h.engine.drain());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.synced + b.synced, 3);
    assert_eq!(h.remote.written().len(), 3);
}

#[tokio::test]
async fn offline_submit_resolves_without_waiting() {
    let h = Harness::new(false, RetryPolicy::default());
    let outcome = tokio::time::timeout(
        Duration::ZERO,
        h.engine.submit(MutationKind::CreateLead, lead("Asha")),
    )
    .await
    .expect("offline submit completes on first poll")
    .unwrap();

    let local_id = queued_id(outcome);
    let queued = h.queue.get(&local_id).unwrap().unwrap();
    assert_eq!(queued.status, MutationStatus::Pending);
    assert!(h.remote.written().is_empty());
}

#[tokio::test]
async fn empty_drain_is_a_noop() {
    let h = Harness::new(true, RetryPolicy::default());
    let report = h.engine.drain().await.unwrap();
    assert!(report.is_noop());
    let report = h.engine.drain().await.unwrap();
    assert!(report.is_noop());
    assert!(h.remote.written().is_empty());
}

#[tokio::test]
async fn lead_then_note_sync_in_order() {
    let h = Harness::new(false, RetryPolicy::default());
    let mut events = h.engine.subscribe_events();

    let lead_id = queued_id(
        h.engine
            .submit(MutationKind::CreateLead, lead("Asha"))
            .await
            .unwrap(),
    );
    let note_id = queued_id(
        h.engine
            .submit(
                MutationKind::AddNote,
                payload(json!({ "lead_id": lead_id, "note": "call after 5pm" })),
            )
            .await
            .unwrap(),
    );

    h.monitor.set_online(true);
    let report = h.engine.drain().await.unwrap();
    assert_eq!(report.synced, 2);

    let written = h.remote.written();
    assert_eq!(written[0].0, MutationKind::CreateLead);
    assert_eq!(written[1].0, MutationKind::AddNote);
    assert_eq!(written[1].1["lead_id"], "srv-1");
    assert_eq!(h.queue.resolve_id(&lead_id).unwrap().as_deref(), Some("srv-1"));

    let mut synced = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MutationEvent::Synced { id, .. } = event {
            synced.push(id);
        }
    }
    assert_eq!(synced, vec![lead_id, note_id]);
}

#[tokio::test]
async fn network_failure_while_online_falls_back_to_queue() {
    let h = Harness::new(true, RetryPolicy::default());
    h.remote
        .fail_next(SyncError::Network("connection reset".into()));

    let outcome = h
        .engine
        .submit(MutationKind::CreateLead, lead("Ravi"))
        .await
        .unwrap();
    assert!(outcome.is_offline());

    let local_id = queued_id(outcome);
    let queued = h.queue.list(Some(MutationStatus::Pending)).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, local_id);
    assert_eq!(queued[0].attempts, 0);
}

#[tokio::test]
async fn three_failed_drains_mark_the_mutation_failed() {
    let h = Harness::new(false, RetryPolicy::immediate(3));
    let id = queued_id(
        h.engine
            .submit(
                MutationKind::LogCall,
                payload(json!({ "lead_id": "L-1", "outcome": "no answer" })),
            )
            .await
            .unwrap(),
    );
    h.monitor.set_online(true);

    for attempt in 1..=3 {
        h.remote.fail_next(SyncError::Network("timeout".into()));
        h.engine.drain().await.unwrap();
        assert_eq!(h.queue.get(&id).unwrap().unwrap().attempts, attempt);
    }

    let failed = h.queue.get(&id).unwrap().unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert!(failed.last_error.unwrap().contains("timeout"));

    let report = h.engine.drain().await.unwrap();
    assert!(report.is_noop());
    assert_eq!(h.remote.written().len(), 3);
}

#[tokio::test]
async fn offline_drain_makes_no_calls() {
    let h = Harness::new(false, RetryPolicy::default());
    h.engine
        .submit(MutationKind::CreateLead, lead("Asha"))
        .await
        .unwrap();
    let report = h.engine.drain().await.unwrap();
    assert!(report.is_noop());
    assert!(h.remote.written().is_empty());
}

#[tokio::test]
async fn queued_mutations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let queue = MutationQueue::open(&path).unwrap();
    queue
        .enqueue(MutationKind::CreateLead, lead("Asha"))
        .unwrap();
    drop(queue);

    let reopened = MutationQueue::open(&path).unwrap();
    let pending = reopened.list(Some(MutationStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, MutationKind::CreateLead);
}

#[tokio::test]
async fn second_process_never_resends_an_in_flight_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let monitor = ConnectivityMonitor::new(true);
    let remote = Arc::new(FakeRemote::default());
    remote.set_write_delay(Duration::from_millis(200));
    let open_engine = || {
        SyncEngine::new(
            SyncContext::new(Arc::new(MutationQueue::open(&path).unwrap()), monitor.state()),
            remote.clone(),
            RetryPolicy::immediate(3),
        )
    };
    let daemon = open_engine();
    let cli = open_engine();
    daemon
        .queue()
        .enqueue(
            MutationKind::AddNote,
            payload(json!({ "lead_id": "L-1", "note": "call after lunch" })),
        )
        .unwrap();

    let one_shot = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let recovered = cli.recover().unwrap();
        let report = cli.drain().await.unwrap();
        (recovered, report)
    };
    let (daemon_report, (recovered, cli_report)) = tokio::join!(daemon.drain(), one_shot);

    assert_eq!(recovered, 0);
    assert_eq!(cli_report.synced, 0);
    assert_eq!(daemon_report.unwrap().synced, 1);
    assert_eq!(remote.written().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_triggers_exactly_one_drain() {
    let h = Harness::new(false, RetryPolicy::default());
    h.engine
        .submit(MutationKind::CreateLead, lead("Asha"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let triggers = h.monitor.drain_triggers(cancel.clone());
    let engine = h.engine.clone();
    let runner = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .run(triggers, Duration::from_secs(3600), cancel)
                .await
        })
    };

    // Flap a few times; the monitor debounces these into one trigger
    h.monitor.set_online(true);
    h.monitor.set_online(false);
    h.monitor.set_online(true);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.remote.written().len(), 1);
    assert_eq!(h.engine.pending_count().unwrap(), 0);

    cancel.cancel();
    runner.await.unwrap();
}
