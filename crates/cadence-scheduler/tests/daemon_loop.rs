mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::types::IntervalCode;
use cadence_scheduler::{
    DaemonLoop, DaemonSettings, DaemonState, JobPreparer, MemorySink, NewRunTemplate,
    RecoveryReport, SchedulerError, SchedulingEngine, WindowCalculator,
};
use tokio::sync::watch;

use common::FlakyStore;

fn fast_settings() -> DaemonSettings {
    DaemonSettings {
        tick_interval: Duration::from_millis(10),
        startup_retries: 3,
        reconnect_base: Duration::from_millis(5),
        reconnect_cap: Duration::from_millis(20),
        orphan_grace: Duration::from_secs(3600),
    }
}

fn daemon(store: &Arc<FlakyStore>) -> DaemonLoop<FlakyStore> {
    daemon_with(store, fast_settings())
}

fn daemon_with(store: &Arc<FlakyStore>, settings: DaemonSettings) -> DaemonLoop<FlakyStore> {
    let engine = SchedulingEngine::new(
        store.clone(),
        WindowCalculator::default(),
        Arc::new(MemorySink::new()),
    );
    DaemonLoop::new(engine, store.clone(), settings)
}

async fn wait_for_state(rx: &mut watch::Receiver<DaemonState>, state: DaemonState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

#[tokio::test]
async fn unreachable_storage_at_startup_is_fatal() {
    let store = Arc::new(FlakyStore::new());
    store.set_down(true);
    let daemon = daemon(&store);
    let state = daemon.subscribe();
    let (_tx, rx) = watch::channel(false);

    let err = daemon.run(rx).await.unwrap_err();
    assert!(matches!(err, SchedulerError::StartupFailed { attempts: 3, .. }));
    assert_eq!(store.health_checks.load(Ordering::SeqCst), 3);
    assert_eq!(*state.borrow(), DaemonState::Stopped);
}

#[tokio::test]
async fn storage_that_comes_up_during_startup_is_accepted() {
    let store = Arc::new(FlakyStore::new());
    store.set_down(true);
    let daemon = daemon_with(
        &store,
        DaemonSettings {
            startup_retries: 50,
            ..fast_settings()
        },
    );

    let flaky = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(8)).await;
        flaky.set_down(false);
    });

    let report = daemon.startup().await.unwrap();
    assert_eq!(report.orphaned_jobs, 0);
    assert!(store.health_checks.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn outage_while_running_recovers_and_resumes() {
    let store = Arc::new(FlakyStore::new());
    let tenant = store.inner.insert_tenant("Company A", true).unwrap();
    let daemon = daemon(&store);
    let mut state = daemon.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(daemon.run(shutdown_rx));

    wait_for_state(&mut state, DaemonState::Running).await;

    store.set_down(true);
    wait_for_state(&mut state, DaemonState::ReconnectingDb).await;

    store.set_down(false);
    wait_for_state(&mut state, DaemonState::Running).await;

    // scheduling continues after recovery
    let id = store
        .inner
        .insert_run_template(&NewRunTemplate::new(tenant, "minutely", IntervalCode::Minute))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.inner.jobs_for_template(id).unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job enqueued after recovery");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), DaemonState::Stopped);
}

#[tokio::test]
async fn shutdown_during_reconnect_stops_cleanly() {
    let store = Arc::new(FlakyStore::new());
    store.inner.insert_tenant("Company A", true).unwrap();
    let daemon = daemon(&store);
    let mut state = daemon.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(daemon.run(shutdown_rx));

    wait_for_state(&mut state, DaemonState::Running).await;
    store.set_down(true);
    wait_for_state(&mut state, DaemonState::ReconnectingDb).await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), DaemonState::Stopped);
}

#[tokio::test]
async fn startup_recovery_purges_stale_records() {
    let store = Arc::new(FlakyStore::new());
    let tenant = store.inner.insert_tenant("Company A", true).unwrap();
    let id = store
        .inner
        .insert_run_template(&NewRunTemplate::new(tenant, "gone", IntervalCode::Hour))
        .unwrap();
    let template = store.inner.get_run_template(id).unwrap().unwrap();
    store
        .inner
        .prepare_and_enqueue(&template, chrono::Utc::now(), "Native", template.trigger_source())
        .unwrap();
    store.inner.delete_run_template(id).unwrap();

    let daemon = daemon(&store);
    let report = daemon.startup().await.unwrap();
    assert_eq!(report.orphaned_jobs, 1);
    assert_eq!(store.inner.queue_len().unwrap(), 0);
}

#[tokio::test]
async fn failed_recovery_does_not_block_scheduling() {
    let store = Arc::new(FlakyStore::new());
    let tenant = store.inner.insert_tenant("Company A", true).unwrap();
    let id = store
        .inner
        .insert_run_template(&NewRunTemplate::new(tenant, "minutely", IntervalCode::Minute))
        .unwrap();
    store.set_fail_purges(true);
    let daemon = daemon(&store);

    let err = daemon.recover().unwrap_err();
    assert!(!err.is_connectivity());
    assert_eq!(daemon.startup().await.unwrap(), RecoveryReport::default());

    let report = daemon.run_single().await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(store.inner.jobs_for_template(id).unwrap().len(), 1);
}

#[tokio::test]
async fn single_run_does_one_pass_and_stops() {
    let store = Arc::new(FlakyStore::new());
    let tenant = store.inner.insert_tenant("Company A", true).unwrap();
    let id = store
        .inner
        .insert_run_template(&NewRunTemplate::new(tenant, "minutely", IntervalCode::Minute))
        .unwrap();
    let daemon = daemon(&store);

    let report = daemon.run_single().await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(store.inner.jobs_for_template(id).unwrap().len(), 1);
    assert_eq!(daemon.state(), DaemonState::Stopped);
}
