//! Mix admission: priority, capacity, duplicates and completions

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;

use whirlpool_client::config::MixConfig;
use whirlpool_client::mix::{
    DefaultUtxoPriority, MixScheduler, MixSchedulerHandle, SchedulerError, UtxoPriority,
};
use whirlpool_client::types::{UnspentOutput, WhirlpoolAccount, WhirlpoolUtxo, WhirlpoolUtxoStatus};
use whirlpool_client::utxo_store::UtxoStore;

fn mix_config(max_clients: usize) -> MixConfig {
    MixConfig {
        max_clients,
        client_delay_secs: 0,
        min_confirmations: 1,
        requeue_on_failure: true,
    }
}

fn throttled_config(max_clients: usize, client_delay_secs: u64) -> MixConfig {
    MixConfig {
        client_delay_secs,
        ..mix_config(max_clients)
    }
}

fn premix(n: u64, value: u64) -> WhirlpoolUtxo {
    WhirlpoolUtxo::new(
        UnspentOutput::new(txid(n), 0, value, 3),
        WhirlpoolAccount::Premix,
    )
    .with_pool("0.01btc")
}

fn queued(n: u64, value: u64) -> WhirlpoolUtxo {
    let mut utxo = premix(n, value);
    utxo.set_status(WhirlpoolUtxoStatus::MixQueue);
    utxo
}

fn start(
    max_clients: usize,
    store: &UtxoStore,
) -> (MixScheduler, MixSchedulerHandle, RunnerProbe, Arc<RecordingRunner>) {
    let (runner, probe) = RecordingRunner::new();
    let scheduler = MixScheduler::start(
        &mix_config(max_clients),
        store.clone(),
        runner.clone(),
        Arc::new(DefaultUtxoPriority),
    )
    .expect("scheduler thread");
    let handle = scheduler.handle();
    (scheduler, handle, probe, runner)
}

fn status(store: &UtxoStore, key: &str) -> WhirlpoolUtxoStatus {
    store.get(key).expect("utxo").status
}

#[test]
fn higher_priority_is_admitted_first_and_second_waits_for_completion() {
    init_test_logging();
    let store = UtxoStore::new();
    let small = queued(1, 1_000_500);
    let large = queued(2, 1_000_900);
    store.insert(small.clone());
    store.insert(large.clone());

    let (_scheduler, handle, probe, _runner) = start(1, &store);

    let (first, listener) = probe.next_started();
    assert_eq!(first, large.key());
    probe.assert_none_started();
    assert!(wait_until(|| handle.state().nb_idle == 0));
    assert_eq!(status(&store, &large.key()), WhirlpoolUtxoStatus::Mixing);
    assert_eq!(status(&store, &small.key()), WhirlpoolUtxoStatus::MixQueue);

    listener.on_success();

    let (second, _) = probe.next_started();
    assert_eq!(second, small.key());
    let done = store.get(&large.key()).unwrap();
    assert_eq!(done.status, WhirlpoolUtxoStatus::MixSuccess);
    assert_eq!(done.mixs_done, 1);
}

#[test]
fn in_flight_never_exceeds_max_clients() {
    init_test_logging();
    let store = UtxoStore::new();
    for n in 1..=6 {
        store.insert(queued(n, 1_000_000 + n));
    }

    let (_scheduler, handle, probe, _runner) = start(2, &store);

    let (_, first) = probe.next_started();
    let (_, second) = probe.next_started();
    probe.assert_none_started();
    let state = handle.state();
    assert!(state.utxos_mixing.len() <= 2);
    assert_eq!(state.max_clients, 2);

    first.on_fail();
    let (_, third) = probe.next_started();
    probe.assert_none_started();
    assert!(handle.state().utxos_mixing.len() <= 2);

    second.on_success();
    third.on_success();
    let _ = probe.next_started();
    let _ = probe.next_started();
    probe.assert_none_started();
    assert!(wait_until(|| handle.state().utxos_mixing.len() == 2));
}

#[test]
fn queueing_a_mixing_utxo_changes_nothing() {
    init_test_logging();
    let store = UtxoStore::new();
    let utxo = premix(1, 1_000_500);
    store.insert(utxo.clone());
    let (_scheduler, handle, probe, _runner) = start(2, &store);

    handle.mix_queue(&utxo.key()).unwrap();
    let _ = probe.next_started();
    assert!(wait_until(|| handle.state().utxos_mixing.len() == 1));

    let err = handle.mix_queue(&utxo.key()).unwrap_err();
    assert_eq!(err, SchedulerError::AlreadyMixing(utxo.key()));
    assert_eq!(status(&store, &utxo.key()), WhirlpoolUtxoStatus::Mixing);
    assert_eq!(handle.state().utxos_mixing.len(), 1);
    probe.assert_none_started();
}

#[test]
fn queueing_without_pool_is_refused() {
    init_test_logging();
    let store = UtxoStore::new();
    let utxo = WhirlpoolUtxo::new(
        UnspentOutput::new(txid(1), 0, 1_000_500, 3),
        WhirlpoolAccount::Premix,
    );
    store.insert(utxo.clone());
    let (_scheduler, handle, probe, _runner) = start(1, &store);

    assert_eq!(
        handle.mix_queue(&utxo.key()),
        Err(SchedulerError::NoPool(utxo.key()))
    );
    assert_eq!(status(&store, &utxo.key()), WhirlpoolUtxoStatus::Ready);
    assert_eq!(
        handle.mix_queue("unknown:0"),
        Err(SchedulerError::UnknownUtxo("unknown:0".to_string()))
    );
    probe.assert_none_started();
}

#[test]
fn unconfirmed_utxo_waits_for_confirmation() {
    init_test_logging();
    let store = UtxoStore::new();
    let mut utxo = queued(1, 1_000_500);
    utxo.utxo.confirmations = 0;
    store.insert(utxo.clone());
    let (_scheduler, handle, probe, _runner) = start(1, &store);

    probe.assert_none_started();
    assert_eq!(handle.state().nb_queued, 1);

    let changes = store.refresh(
        WhirlpoolAccount::Premix,
        vec![UnspentOutput::new(txid(1), 0, 1_000_500, 1)],
        1,
    );
    assert_eq!(changes.confirmed, vec![utxo.key()]);
    handle.on_refresh(&changes).unwrap();

    let (started, _) = probe.next_started();
    assert_eq!(started, utxo.key());
}

#[test]
fn deposit_utxos_are_never_mixed() {
    init_test_logging();
    let store = UtxoStore::new();
    let mut deposit = WhirlpoolUtxo::new(
        UnspentOutput::new(txid(1), 0, 1_000_500, 3),
        WhirlpoolAccount::Deposit,
    )
    .with_pool("0.01btc");
    deposit.set_status(WhirlpoolUtxoStatus::MixQueue);
    store.insert(deposit);

    let (_scheduler, handle, probe, _runner) = start(1, &store);
    handle.notify().unwrap();
    probe.assert_none_started();
    assert_eq!(handle.state().nb_queued, 0);
}

#[test]
fn siblings_of_a_mixing_utxo_wait() {
    init_test_logging();
    let store = UtxoStore::new();
    let mut a = queued(1, 1_000_500);
    a.utxo.index = 0;
    let mut b = queued(1, 1_000_400);
    b.utxo.index = 1;
    store.insert(a.clone());
    store.insert(b.clone());

    let (_scheduler, _handle, probe, _runner) = start(2, &store);
    let (first, listener) = probe.next_started();
    assert_eq!(first, a.key());
    probe.assert_none_started();

    listener.on_success();
    let (second, _) = probe.next_started();
    assert_eq!(second, b.key());
}

#[test]
fn failed_mix_is_requeued() {
    init_test_logging();
    let store = UtxoStore::new();
    let utxo = queued(1, 1_000_500);
    store.insert(utxo.clone());

    let (_scheduler, _handle, probe, _runner) = start(1, &store);
    let (_, listener) = probe.next_started();
    listener.on_fail();
    // a late duplicate callback is ignored
    listener.on_success();

    let (again, _) = probe.next_started();
    assert_eq!(again, utxo.key());
    assert_eq!(store.get(&utxo.key()).unwrap().mixs_done, 0);
}

#[test]
fn failed_mix_stays_failed_without_requeue() {
    init_test_logging();
    let store = UtxoStore::new();
    let utxo = queued(1, 1_000_500);
    store.insert(utxo.clone());

    let (runner, probe) = RecordingRunner::new();
    let config = MixConfig {
        requeue_on_failure: false,
        ..mix_config(1)
    };
    let _scheduler =
        MixScheduler::start(&config, store.clone(), runner, Arc::new(DefaultUtxoPriority)).unwrap();

    let (_, listener) = probe.next_started();
    listener.on_fail();
    assert!(wait_until(|| status(&store, &utxo.key()) == WhirlpoolUtxoStatus::MixFailed));
    probe.assert_none_started();
}

#[test]
fn runner_refusal_marks_failed_and_moves_on() {
    init_test_logging();
    let store = UtxoStore::new();
    let refused = queued(1, 1_000_900);
    let other = queued(2, 1_000_500);
    store.insert(refused.clone());
    store.insert(other.clone());

    let (runner, probe) = RecordingRunner::new();
    runner.refuse(&refused.key());
    let _scheduler = MixScheduler::start(
        &mix_config(1),
        store.clone(),
        runner,
        Arc::new(DefaultUtxoPriority),
    )
    .unwrap();

    let (started, _) = probe.next_started();
    assert_eq!(started, other.key());
    assert_eq!(status(&store, &refused.key()), WhirlpoolUtxoStatus::MixFailed);
}

#[test]
fn mix_stop_dequeues_or_cancels() {
    init_test_logging();
    let store = UtxoStore::new();
    let running = queued(1, 1_000_900);
    let waiting = queued(2, 1_000_500);
    store.insert(running.clone());
    store.insert(waiting.clone());

    let (_scheduler, handle, probe, _runner) = start(1, &store);
    let (started, listener) = probe.next_started();
    assert_eq!(started, running.key());

    handle.mix_stop(&waiting.key()).unwrap();
    assert_eq!(status(&store, &waiting.key()), WhirlpoolUtxoStatus::Ready);

    handle.mix_stop(&running.key()).unwrap();
    let cancelled = probe
        .cancelled
        .recv_timeout(std::time::Duration::from_secs(5))
        .unwrap();
    assert_eq!(cancelled, running.key());

    // the runner reports the cancelled session as failed
    listener.on_fail();
    assert!(wait_until(|| handle.state().utxos_mixing.is_empty()));
}

#[test]
fn postmix_with_remaining_mixes_is_requeued_on_detection() {
    init_test_logging();
    let store = UtxoStore::new();
    let (_scheduler, handle, probe, _runner) = start(1, &store);

    let unspent = UnspentOutput::new(txid(9), 2, 1_000_000, 1);
    let changes = store.refresh(WhirlpoolAccount::Postmix, vec![unspent.clone()], 1);
    assert_eq!(changes.detected, vec![unspent.key()]);
    store.set_pool(&unspent.key(), Some("0.01btc".to_string()));
    store.set_mixs_target(&unspent.key(), 3);
    handle.on_refresh(&changes).unwrap();

    let (started, _) = probe.next_started();
    assert_eq!(started, unspent.key());
}

#[test]
fn postmix_at_target_is_left_alone() {
    init_test_logging();
    let store = UtxoStore::new();
    let (_scheduler, handle, probe, _runner) = start(1, &store);

    let unspent = UnspentOutput::new(txid(9), 2, 1_000_000, 1);
    store.refresh(WhirlpoolAccount::Postmix, vec![unspent.clone()], 1);
    store.set_pool(&unspent.key(), Some("0.01btc".to_string()));
    store.update(&unspent.key(), |utxo| utxo.mixs_done = 1);

    handle.on_utxo_detected(&unspent.key()).unwrap();
    probe.assert_none_started();
    assert_eq!(status(&store, &unspent.key()), WhirlpoolUtxoStatus::Ready);
}

#[test]
fn custom_priority_is_used() {
    init_test_logging();
    let store = UtxoStore::new();
    let small = queued(1, 1_000_100);
    let large = queued(2, 1_000_900);
    store.insert(small.clone());
    store.insert(large.clone());

    let smallest_first = |a: &WhirlpoolUtxo, b: &WhirlpoolUtxo| a.utxo.value.cmp(&b.utxo.value);
    let priority: Arc<dyn UtxoPriority> = Arc::new(smallest_first);
    let (runner, probe) = RecordingRunner::new();
    let _scheduler = MixScheduler::start(&mix_config(1), store.clone(), runner, priority).unwrap();

    let (first, _) = probe.next_started();
    assert_eq!(first, small.key());
}

#[test]
fn sessions_start_no_faster_than_client_delay() {
    init_test_logging();
    let store = UtxoStore::new();
    store.insert(queued(1, 1_000_900));
    store.insert(queued(2, 1_000_500));

    let (runner, probe) = RecordingRunner::new();
    let _scheduler = MixScheduler::start(
        &throttled_config(2, 1),
        store.clone(),
        runner,
        Arc::new(DefaultUtxoPriority),
    )
    .unwrap();

    let _first = probe.next_started();
    let first_at = Instant::now();
    let _second = probe.next_started();
    let gap = first_at.elapsed();
    assert!(gap >= Duration::from_millis(900), "gap between starts: {:?}", gap);
}

#[test]
fn completion_at_full_capacity_is_applied_before_the_throttled_start() {
    init_test_logging();
    let store = UtxoStore::new();
    let large = queued(1, 1_000_900);
    let small = queued(2, 1_000_500);
    store.insert(large.clone());
    store.insert(small.clone());

    let (runner, probe) = RecordingRunner::new();
    let scheduler = MixScheduler::start(
        &throttled_config(1, 1),
        store.clone(),
        runner,
        Arc::new(DefaultUtxoPriority),
    )
    .unwrap();
    let handle = scheduler.handle();

    let (first, listener) = probe.next_started();
    let first_at = Instant::now();
    assert_eq!(first, large.key());
    assert!(wait_until(|| handle.state().nb_idle == 0));

    listener.on_success();
    assert!(wait_until(|| handle.state().utxos_mixing.is_empty()));
    assert!(first_at.elapsed() < Duration::from_millis(900));
    assert_eq!(status(&store, &large.key()), WhirlpoolUtxoStatus::MixSuccess);
    assert_eq!(status(&store, &small.key()), WhirlpoolUtxoStatus::MixQueue);

    let (second, _) = probe.next_started();
    assert_eq!(second, small.key());
    assert!(first_at.elapsed() >= Duration::from_millis(900));
}

#[test]
fn requests_are_answered_while_throttled() {
    init_test_logging();
    let store = UtxoStore::new();
    let first = queued(1, 1_000_900);
    let waiting = queued(2, 1_000_500);
    store.insert(first.clone());
    store.insert(waiting.clone());

    let (runner, probe) = RecordingRunner::new();
    let scheduler = MixScheduler::start(
        &throttled_config(2, 2),
        store.clone(),
        runner,
        Arc::new(DefaultUtxoPriority),
    )
    .unwrap();
    let handle = scheduler.handle();

    let (started, _listener) = probe.next_started();
    assert_eq!(started, first.key());

    let asked_at = Instant::now();
    handle.mix_stop(&waiting.key()).unwrap();
    assert!(asked_at.elapsed() < Duration::from_secs(1));
    assert_eq!(status(&store, &waiting.key()), WhirlpoolUtxoStatus::Ready);

    // the delay runs out with nothing left to start
    assert!(probe
        .started
        .recv_timeout(Duration::from_millis(2_500))
        .is_err());
    assert_eq!(handle.state().utxos_mixing.len(), 1);
}

#[test]
fn stopped_scheduler_refuses_requests() {
    init_test_logging();
    let store = UtxoStore::new();
    let utxo = premix(1, 1_000_500);
    store.insert(utxo.clone());

    let (scheduler, handle, _probe, _runner) = start(1, &store);
    scheduler.stop();

    assert_eq!(handle.mix_queue(&utxo.key()), Err(SchedulerError::Stopped));
    assert_eq!(handle.notify(), Err(SchedulerError::Stopped));
}
