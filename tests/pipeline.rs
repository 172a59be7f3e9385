use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use trial_indexer::decoder::{decode_transaction, OnChainEvent, TransactionLogs, TrialRegisteredLog};
use trial_indexer::events::{
    EventKind, EventPayload, FeeCharged, PoolRegistered, Pubkey, RawEvent, TrialResolved,
};
use trial_indexer::fixed_point::{Amount, SCALE};
use trial_indexer::pipeline::{FeeSplitPolicy, Pipeline};
use trial_indexer::queue::{Dispatcher, Job, RecordingDispatcher};
use trial_indexer::storage::{StateStore, Table};
use trial_indexer::{PipelineError, PipelineResult, Prerequisite};

const POOL: Pubkey = Pubkey([1u8; 32]);
const USER: Pubkey = Pubkey([2u8; 32]);
const EXTRA: [u8; 32] = [9u8; 32];

struct Harness {
    _dir: TempDir,
    path: String,
    pipeline: Pipeline,
    jobs: Arc<RecordingDispatcher>,
}

fn open_store(path: &str) -> StateStore {
    let store = StateStore::new(path).unwrap();
    store.init().unwrap();
    store
}

fn harness(policy: FeeSplitPolicy) -> Harness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("indexer.sqlite").to_str().unwrap().to_string();
    let jobs = Arc::new(RecordingDispatcher::new());
    let pipeline = Pipeline::new(Arc::new(open_store(&path)), jobs.clone(), policy);
    Harness { _dir: dir, path, pipeline, jobs }
}

impl Harness {
    fn store(&self) -> &StateStore {
        self.pipeline.store()
    }

    /// Runs recorded jobs, and the jobs they schedule, until none remain.
    /// Returns every job it ran.
    fn drain(&self) -> Vec<Job> {
        let mut handled = Vec::new();
        loop {
            let jobs = self.jobs.take();
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                self.pipeline.handle(&job).unwrap();
                handled.push(job);
            }
        }
        handled
    }

    fn ingest(&self, signature: &str, slot: u64, lines: Vec<String>) -> Vec<RawEvent> {
        let events = decode(signature, slot, lines);
        self.pipeline.store_batch(signature, &events).unwrap();
        events
    }
}

fn decode(signature: &str, slot: u64, lines: Vec<String>) -> Vec<RawEvent> {
    decode_transaction(&TransactionLogs {
        signature: signature.to_string(),
        slot,
        block_time: Some(1_700_000_000),
        instruction_index: 0,
        logs: lines,
    })
}

fn pool_line() -> String {
    pool_line_with_fees((SCALE / 100) as u64, (3 * SCALE / 100) as u64)
}

fn pool_line_with_fees(host_fee_percent: u64, pool_fee_percent: u64) -> String {
    OnChainEvent::PoolRegistered(PoolRegistered {
        pool: POOL,
        manager: Pubkey([3u8; 32]),
        host_fee_percent,
        pool_fee_percent,
        min_multiplier: 1,
        max_multiplier: u64::MAX,
    })
    .to_log_line()
}

fn trial_line(trial_id: u64, multiplier: u64, k: Vec<u128>) -> String {
    OnChainEvent::TrialRegistered(TrialRegisteredLog {
        trial_id,
        pool: POOL,
        user: USER,
        multiplier,
        q: vec![SCALE / k.len() as u128; k.len()],
        k,
        extra_data_hash: EXTRA,
        host_fee_percent: 0,
        pool_fee_percent: 0,
    })
    .to_log_line()
}

fn resolved_line(trial_id: u64, result_index: u32) -> String {
    OnChainEvent::TrialResolved(TrialResolved { trial_id, result_index }).to_log_line()
}

fn fee_line(trial_id: u64, fee_amount: u64) -> String {
    OnChainEvent::FeeCharged(FeeCharged { trial_id, pool: POOL, fee_amount }).to_log_line()
}

fn interpret_jobs(jobs: &[Job]) -> usize {
    jobs.iter().filter(|j| matches!(j, Job::Interpret { .. })).count()
}

fn create_jobs(jobs: &[Job]) -> usize {
    jobs.iter().filter(|j| matches!(j, Job::CreateGameInstance { .. })).count()
}

/// Rejects the next `n` dispatches the way a closed queue would, then records.
struct FlakyDispatcher {
    failures: AtomicUsize,
    inner: RecordingDispatcher,
}

impl FlakyDispatcher {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            inner: RecordingDispatcher::new(),
        }
    }

    fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl Dispatcher for FlakyDispatcher {
    fn dispatch(&self, job: Job) -> PipelineResult<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PipelineError::QueueClosed);
        }
        self.inner.dispatch(job)
    }
}

#[test]
fn storing_twice_keeps_one_row_and_one_interpret_job() {
    let h = harness(FeeSplitPolicy::Even);
    let events = decode("sig-pool", 100, vec![pool_line()]);
    assert_eq!(events.len(), 1);

    assert!(h.pipeline.store_event(&events[0]).unwrap());
    assert!(!h.pipeline.store_event(&events[0]).unwrap());

    assert_eq!(h.store().count_raw_events().unwrap(), 1);
    let jobs = h.jobs.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0], Job::interpret(&events[0]));
    assert_eq!(jobs[0].name(), "interpret.pool_registered");
}

#[test]
fn redelivered_transaction_batch_is_a_no_op() {
    let h = harness(FeeSplitPolicy::Even);
    let lines = vec![pool_line(), trial_line(1, 10, vec![0, 2 * SCALE])];
    let events = decode("sig", 100, lines);
    assert_eq!(h.pipeline.store_batch("sig", &events).unwrap(), 3);
    assert_eq!(h.pipeline.store_batch("sig", &events).unwrap(), 0);
    assert_eq!(h.store().count_raw_events().unwrap(), 3);
    assert_eq!(interpret_jobs(&h.jobs.jobs()), 3);
}

#[test]
fn interpreting_twice_does_not_double_apply() {
    let h = harness(FeeSplitPolicy::Even);
    let mut all = h.ingest("sig-1", 100, vec![pool_line()]);
    all.extend(h.ingest("sig-2", 101, vec![trial_line(7, 1_000, vec![0, 3 * SCALE])]));
    all.extend(h.ingest("sig-3", 102, vec![resolved_line(7, 1), fee_line(7, 1_000)]));
    h.drain();

    for event in &all {
        assert!(!h.pipeline.interpret(event.kind(), &event.order_index).unwrap());
    }
    assert_eq!(h.pipeline.resolve_game_instance(7, 1).unwrap(), None);
    assert!(!h.pipeline.create_game_instance(7).unwrap());
    assert!(h.jobs.jobs().is_empty());

    let stats = h.store().user_stats(&USER.to_string()).unwrap().unwrap();
    assert_eq!(stats.bets, 1);
    assert_eq!(stats.wins, 1);
    assert_eq!(stats.total_payout, Amount::from(2_000u64));
    assert_eq!(h.store().global_stats().unwrap().plays, 1);
    assert_eq!(h.store().count(Table::Fees).unwrap(), 1);
    assert_eq!(h.store().count(Table::Interpretations).unwrap(), all.len() as u64);
}

#[test]
fn trial_waits_for_pool_then_succeeds_on_retry() {
    let h = harness(FeeSplitPolicy::Even);
    let trial_events = h.ingest("sig-trial", 200, vec![trial_line(77, 5, vec![SCALE])]);
    let (config, trial) = (&trial_events[0], &trial_events[1]);

    assert!(h.pipeline.interpret(EventKind::QkWithConfigRegistered, &config.order_index).unwrap());

    let err = h.pipeline.interpret(EventKind::TrialRegistered, &trial.order_index).unwrap_err();
    assert!(err.is_retryable());
    match err {
        PipelineError::MissingPrerequisite(Prerequisite::Pool(address)) => {
            assert_eq!(address, POOL.to_string());
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.store().trial(77).unwrap().is_none());
    assert!(!h.store().is_interpreted(&trial.order_index).unwrap());

    // The pool lands later, then the same job is redelivered.
    let pool = h.ingest("sig-pool", 150, vec![pool_line()]);
    assert!(h.pipeline.interpret(EventKind::PoolRegistered, &pool[0].order_index).unwrap());
    h.jobs.take();

    assert!(h.pipeline.interpret(EventKind::TrialRegistered, &trial.order_index).unwrap());
    let stored = h.store().trial(77).unwrap().unwrap();
    assert_eq!(stored.pool, POOL.to_string());
    assert_eq!(h.jobs.jobs(), vec![Job::CreateGameInstance { trial_id: 77 }]);
}

#[test]
fn trial_waits_for_outcome_config() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-pool", 1, vec![pool_line()]);
    h.drain();
    let events = h.ingest("sig-trial", 2, vec![trial_line(3, 5, vec![SCALE])]);

    let err = h
        .pipeline
        .interpret(EventKind::TrialRegistered, &events[1].order_index)
        .unwrap_err();
    let EventPayload::QkWithConfigRegistered(cfg) = &events[0].event else {
        panic!("config must come first");
    };
    assert!(matches!(
        err,
        PipelineError::MissingPrerequisite(Prerequisite::OutcomeConfig(ref hash))
            if *hash == cfg.qk_with_config_hash
    ));
}

#[test]
fn resolution_arithmetic_is_exact() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-1", 10, vec![pool_line()]);
    h.ingest("sig-2", 11, vec![trial_line(42, 1_000_000_000, vec![2_500_000_000_000_000_000])]);
    h.ingest("sig-3", 12, vec![resolved_line(42, 0)]);
    h.drain();

    let trial = h.store().trial(42).unwrap().unwrap();
    let resolution = trial.resolution.unwrap();
    assert_eq!(resolution.result_k, 2_500_000_000_000_000_000);
    assert_eq!(resolution.delta_amount, Amount::from(1_500_000_000u64));

    let game = h.store().game_instance(42).unwrap().unwrap();
    let result = game.result.unwrap();
    assert!(result.is_win);
    assert_eq!(result.delta_amount, "1500000000");
    assert_eq!(result.result_k, "2500000000000000000");

    let user = h.store().user_stats(&USER.to_string()).unwrap().unwrap();
    assert_eq!((user.bets, user.wins, user.losses), (1, 1, 0));
    assert_eq!(user.total_wagered, Amount::from(1_000_000_000u64));
    assert_eq!(user.total_payout, Amount::from(1_500_000_000u64));
    assert_eq!(user.last_trial_id, Some(42));

    let global = h.store().global_stats().unwrap();
    assert_eq!(global.plays, 1);
    assert_eq!(global.total_payout, Amount::from(1_500_000_000u64));
}

#[test]
fn losing_resolution_counts_loss_without_payout() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-1", 10, vec![pool_line(), trial_line(5, 300, vec![0, SCALE / 2])]);
    h.ingest("sig-2", 11, vec![resolved_line(5, 1)]);
    h.drain();

    let trial = h.store().trial(5).unwrap().unwrap();
    assert_eq!(trial.resolution.unwrap().delta_amount, Amount::from(-150i64));
    let user = h.store().user_stats(&USER.to_string()).unwrap().unwrap();
    assert_eq!((user.wins, user.losses), (0, 1));
    assert_eq!(user.total_payout, Amount::ZERO);
    assert!(!h.store().game_instance(5).unwrap().unwrap().result.unwrap().is_win);
}

#[test]
fn out_of_range_result_is_fatal_and_writes_nothing() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-1", 10, vec![pool_line(), trial_line(8, 100, vec![0, 2 * SCALE])]);
    h.drain();
    let resolved = h.ingest("sig-2", 11, vec![resolved_line(8, 2)]);
    h.jobs.take();

    assert!(h.pipeline.interpret(EventKind::TrialResolved, &resolved[0].order_index).unwrap());
    let jobs = h.jobs.take();
    assert_eq!(jobs, vec![Job::ResolveGameInstance { trial_id: 8, result_index: 2 }]);

    let err = h.pipeline.handle(&jobs[0]).unwrap_err();
    assert!(!err.is_retryable());
    assert!(matches!(
        err,
        PipelineError::ResultIndexOutOfRange { trial_id: 8, index: 2, len: 2 }
    ));
    assert!(h.store().trial(8).unwrap().unwrap().resolution.is_none());
    assert!(h.store().game_instance(8).unwrap().unwrap().result.is_none());
    assert!(h.store().user_stats(&USER.to_string()).unwrap().is_none());
    assert_eq!(h.store().global_stats().unwrap().plays, 0);
}

#[test]
fn resolving_unknown_trial_is_fatal() {
    let h = harness(FeeSplitPolicy::Even);
    let err = h.pipeline.resolve_game_instance(999, 0).unwrap_err();
    assert!(matches!(err, PipelineError::UnknownTrial(999)));
    assert!(!err.is_retryable());
}

#[test]
fn identical_configs_collapse_to_one_row() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-pool", 1, vec![pool_line()]);
    let a = h.ingest("sig-a", 2, vec![trial_line(1, 10, vec![0, 2 * SCALE])]);
    let b = h.ingest("sig-b", 3, vec![trial_line(2, 99, vec![0, 2 * SCALE])]);
    h.drain();

    let (EventPayload::QkWithConfigRegistered(ca), EventPayload::QkWithConfigRegistered(cb)) =
        (&a[0].event, &b[0].event)
    else {
        panic!("expected configs at inner index 0");
    };
    assert_ne!(a[0].order_index, b[0].order_index);
    assert_eq!(ca.qk_with_config_hash, cb.qk_with_config_hash);

    assert_eq!(h.store().count(Table::OutcomeConfigs).unwrap(), 1);
    assert!(h.store().is_interpreted(&a[0].order_index).unwrap());
    assert!(h.store().is_interpreted(&b[0].order_index).unwrap());
    let config = h.store().outcome_config(&ca.qk_with_config_hash).unwrap().unwrap();
    assert_eq!(config.order_index, a[0].order_index);
    assert_eq!(config.k, vec![0, 2 * SCALE]);
    for id in [1, 2] {
        let trial = h.store().trial(id).unwrap().unwrap();
        assert_eq!(trial.qk_with_config_hash, ca.qk_with_config_hash);
    }
}

#[test]
fn single_trial_line_scenario() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-pool", 1, vec![pool_line()]);
    h.drain();

    let events = decode("sig-trial", 2, vec![trial_line(11, 500, vec![SCALE, 2 * SCALE])]);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind(), EventKind::QkWithConfigRegistered);
    assert_eq!(events[0].provenance.inner_instruction_index, 0);
    assert_eq!(events[1].kind(), EventKind::TrialRegistered);
    assert_eq!(events[1].provenance.inner_instruction_index, 1);

    for event in &events {
        assert!(h.pipeline.store_event(event).unwrap());
    }
    h.jobs.take();
    for event in &events {
        assert!(h.pipeline.interpret(event.kind(), &event.order_index).unwrap());
    }

    assert_eq!(h.store().count(Table::OutcomeConfigs).unwrap(), 1);
    assert_eq!(h.store().count(Table::Trials).unwrap(), 1);
    let EventPayload::QkWithConfigRegistered(cfg) = &events[0].event else {
        unreachable!()
    };
    let trial = h.store().trial(11).unwrap().unwrap();
    assert_eq!(trial.qk_with_config_hash, cfg.qk_with_config_hash);
    assert!(h.store().outcome_config(&trial.qk_with_config_hash).unwrap().is_some());
}

#[test]
fn fee_is_split_evenly_by_default() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-1", 1, vec![pool_line(), trial_line(4, 10, vec![SCALE])]);
    let fee = h.ingest("sig-2", 2, vec![fee_line(4, 1_001)]);
    h.drain();

    let stored = h.store().fee(&fee[0].order_index).unwrap().unwrap();
    assert_eq!(stored.trial_id, 4);
    assert_eq!(stored.host_percent, SCALE / 2);
    assert_eq!(stored.pool_percent, SCALE / 2);
    assert_eq!(stored.host_amount, Amount::from(500u64));
    assert_eq!(stored.pool_amount, Amount::from(501u64));
    // Fees never move the trial out of Registered.
    assert!(h.store().trial(4).unwrap().unwrap().resolution.is_none());
}

#[test]
fn fee_follows_pool_schedule_when_configured() {
    let h = harness(FeeSplitPolicy::PoolSchedule);
    h.ingest("sig-1", 1, vec![pool_line(), trial_line(4, 10, vec![SCALE])]);
    let fee = h.ingest("sig-2", 2, vec![fee_line(4, 1_000)]);
    h.drain();

    let stored = h.store().fee(&fee[0].order_index).unwrap().unwrap();
    assert_eq!(stored.host_percent, SCALE / 4);
    assert_eq!(stored.host_amount, Amount::from(250u64));
    assert_eq!(stored.pool_amount, Amount::from(750u64));
}

#[test]
fn fee_waits_for_trial() {
    let h = harness(FeeSplitPolicy::Even);
    let fee = h.ingest("sig-fee", 1, vec![fee_line(12, 10)]);
    let err = h.pipeline.interpret(EventKind::FeeCharged, &fee[0].order_index).unwrap_err();
    assert!(matches!(err, PipelineError::MissingPrerequisite(Prerequisite::Trial(12))));
    assert!(h.store().fee(&fee[0].order_index).unwrap().is_none());
}

#[test]
fn concurrent_resolutions_for_one_user_lose_no_updates() {
    const TRIALS: u64 = 24;
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-pool", 1, vec![pool_line()]);
    for id in 0..TRIALS {
        h.ingest(&format!("sig-{}", id), 10 + id, vec![trial_line(id, 100, vec![0, 2 * SCALE])]);
    }
    h.drain();

    // A second connection to the same database file, as another worker process would have.
    let other = Pipeline::new(
        Arc::new(open_store(&h.path)),
        Arc::new(RecordingDispatcher::new()),
        FeeSplitPolicy::Even,
    );

    std::thread::scope(|s| {
        for id in 0..TRIALS {
            let index = (id % 2) as u32;
            let first = &h.pipeline;
            let second = &other;
            s.spawn(move || first.resolve_game_instance(id, index).unwrap());
            // Duplicate delivery of the same resolution.
            s.spawn(move || second.resolve_game_instance(id, index).unwrap());
        }
    });

    let wins = TRIALS / 2;
    let user = h.store().user_stats(&USER.to_string()).unwrap().unwrap();
    assert_eq!(user.bets, TRIALS);
    assert_eq!(user.wins, wins);
    assert_eq!(user.losses, TRIALS - wins);
    assert_eq!(user.total_wagered, Amount::from(100 * TRIALS));
    assert_eq!(user.total_payout, Amount::from(100 * wins));

    let global = other.store().global_stats().unwrap();
    assert_eq!(global.plays, TRIALS);
    assert_eq!(global.total_wagered, Amount::from(100 * TRIALS));
}

#[test]
fn pool_registered_twice_keeps_first_writer() {
    let h = harness(FeeSplitPolicy::Even);
    let first = h.ingest("sig-a", 1, vec![pool_line_with_fees(1, 2)]);
    let second = h.ingest("sig-b", 2, vec![pool_line_with_fees(7, 8)]);
    h.drain();

    assert_ne!(first[0].order_index, second[0].order_index);
    assert!(h.store().is_interpreted(&first[0].order_index).unwrap());
    assert!(h.store().is_interpreted(&second[0].order_index).unwrap());
    assert_eq!(h.store().count(Table::Pools).unwrap(), 1);

    let pool = h.store().pool(&POOL.to_string()).unwrap().unwrap();
    assert_eq!((pool.host_fee_percent, pool.pool_fee_percent), (1, 2));
    assert_eq!(pool.order_index, first[0].order_index);
}

#[test]
fn trial_registered_twice_creates_one_trial_and_one_game() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-pool", 1, vec![pool_line()]);
    let first = h.ingest("sig-a", 2, vec![trial_line(1, 10, vec![0, 2 * SCALE])]);
    let second = h.ingest("sig-b", 3, vec![trial_line(1, 99, vec![0, 2 * SCALE])]);
    let handled = h.drain();

    assert!(h.store().is_interpreted(&second[1].order_index).unwrap());
    assert_eq!(create_jobs(&handled), 1);
    assert_eq!(h.store().count(Table::Trials).unwrap(), 1);
    assert_eq!(h.store().count(Table::GameInstances).unwrap(), 1);

    let trial = h.store().trial(1).unwrap().unwrap();
    assert_eq!(trial.multiplier, 10);
    assert_eq!(trial.order_index, first[1].order_index);
}

#[test]
fn same_event_interpreted_on_two_connections_applies_once() {
    const TRIALS: u64 = 8;
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-pool", 1, vec![pool_line()]);
    let mut trials = Vec::new();
    for id in 0..TRIALS {
        let events = h.ingest(&format!("sig-{}", id), 10 + id, vec![trial_line(id, 5, vec![SCALE])]);
        trials.push(events[1].clone());
    }
    // Everything but the trial registrations.
    for job in h.jobs.take() {
        if !matches!(job, Job::Interpret { kind: EventKind::TrialRegistered, .. }) {
            h.pipeline.handle(&job).unwrap();
        }
    }
    assert!(h.jobs.take().is_empty());

    let other_jobs = Arc::new(RecordingDispatcher::new());
    let other = Pipeline::new(
        Arc::new(open_store(&h.path)),
        other_jobs.clone(),
        FeeSplitPolicy::Even,
    );

    let (left, right) = (&h.pipeline, &other);
    let applied: Vec<(bool, bool)> = std::thread::scope(|s| {
        let handles: Vec<_> = trials
            .iter()
            .map(|trial| {
                let key = trial.order_index.as_str();
                let first = s.spawn(move || {
                    left.interpret(EventKind::TrialRegistered, key).unwrap()
                });
                let second = s.spawn(move || {
                    right.interpret(EventKind::TrialRegistered, key).unwrap()
                });
                (first, second)
            })
            .collect();
        handles
            .into_iter()
            .map(|(a, b)| (a.join().unwrap(), b.join().unwrap()))
            .collect()
    });

    for (a, b) in applied {
        assert!(a ^ b, "exactly one connection applies each event");
    }
    let mut follow_ups = h.jobs.take();
    follow_ups.extend(other_jobs.take());
    follow_ups.sort_by_key(|j| j.key());
    let mut expected: Vec<Job> =
        (0..TRIALS).map(|trial_id| Job::CreateGameInstance { trial_id }).collect();
    expected.sort_by_key(|j| j.key());
    assert_eq!(follow_ups, expected);
    assert_eq!(h.store().count(Table::Trials).unwrap(), TRIALS);
    assert_eq!(h.store().count(Table::Outbox).unwrap(), 0);
}

#[test]
fn failed_follow_up_dispatch_is_resent_on_redelivery() {
    let h = harness(FeeSplitPolicy::Even);
    h.ingest("sig-1", 10, vec![pool_line(), trial_line(6, 100, vec![0, 2 * SCALE])]);
    h.drain();

    let flaky = Arc::new(FlakyDispatcher::new(1));
    let other = Pipeline::new(Arc::new(open_store(&h.path)), flaky.clone(), FeeSplitPolicy::Even);
    let resolved = decode("sig-2", 11, vec![resolved_line(6, 1)]);
    let event = &resolved[0];

    // The row commits but its interpret job never reaches the queue.
    assert!(matches!(other.store_event(event), Err(PipelineError::QueueClosed)));
    assert_eq!(other.store().count_raw_events().unwrap(), 4);
    assert!(!other.store_event(event).unwrap());
    assert_eq!(flaky.inner.take(), vec![Job::interpret(event)]);

    // Same for the resolution the interpretation schedules.
    flaky.fail_next(1);
    let err = other.interpret(EventKind::TrialResolved, &event.order_index).unwrap_err();
    assert!(matches!(err, PipelineError::QueueClosed));
    assert!(other.store().is_interpreted(&event.order_index).unwrap());
    let resolve = Job::ResolveGameInstance { trial_id: 6, result_index: 1 };
    assert_eq!(other.store().pending_jobs(&event.order_index).unwrap(), vec![resolve.clone()]);

    assert!(!other.interpret(EventKind::TrialResolved, &event.order_index).unwrap());
    let jobs = flaky.inner.take();
    assert_eq!(jobs, vec![resolve]);
    other.handle(&jobs[0]).unwrap();

    let resolution = other.store().trial(6).unwrap().unwrap().resolution.unwrap();
    assert_eq!(resolution.delta_amount, Amount::from(100u64));
    assert_eq!(other.store().count(Table::Outbox).unwrap(), 0);
    assert!(!other.interpret(EventKind::TrialResolved, &event.order_index).unwrap());
    assert!(flaky.inner.jobs().is_empty());
}

#[test]
fn undispatched_jobs_are_recovered_at_startup() {
    let h = harness(FeeSplitPolicy::Even);
    let flaky = Arc::new(FlakyDispatcher::new(1));
    let crashed = Pipeline::new(Arc::new(open_store(&h.path)), flaky, FeeSplitPolicy::Even);
    let events = decode("sig-pool", 1, vec![pool_line()]);
    assert!(crashed.store_event(&events[0]).is_err());
    drop(crashed);

    assert_eq!(h.pipeline.recover_outbox().unwrap(), 1);
    assert_eq!(h.jobs.take(), vec![Job::interpret(&events[0])]);
    assert_eq!(h.pipeline.recover_outbox().unwrap(), 0);
}
