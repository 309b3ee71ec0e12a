use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::*;
// `super::*` drags in the crate's single-parameter `Result` alias.
use std::result::Result;

use crate::task::{Work, WorkError};

type TestEngine = Engine<&'static str, u32>;
type TestKey = TaskKey<&'static str>;

struct Produce(u32);

#[async_trait]
impl Work<u32> for Produce {
    async fn process(&self) -> Result<u32, WorkError> {
        Ok(self.0)
    }
}

struct Fail(&'static str);

#[async_trait]
impl Work<u32> for Fail {
    async fn process(&self) -> Result<u32, WorkError> {
        Err(self.0.into())
    }
}

struct Slow {
    delay: Duration,
    value: u32,
}

#[async_trait]
impl Work<u32> for Slow {
    async fn process(&self) -> Result<u32, WorkError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.value)
    }
}

#[derive(Default)]
struct Recording {
    completed: Mutex<Vec<u32>>,
    completed_at: Mutex<Vec<Instant>>,
    canceled: AtomicUsize,
    failed: Mutex<Vec<String>>,
}

impl Observer<u32> for Recording {
    fn on_completed(&self, value: &u32) {
        self.completed.lock().unwrap().push(*value);
        self.completed_at.lock().unwrap().push(Instant::now());
    }

    fn on_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failed(&self, cause: &WorkError) {
        self.failed.lock().unwrap().push(cause.to_string());
    }
}

impl Recording {
    fn completions(&self) -> Vec<u32> {
        self.completed.lock().unwrap().clone()
    }

    fn cancellations(&self) -> usize {
        self.canceled.load(Ordering::SeqCst)
    }

    fn failures(&self) -> Vec<String> {
        self.failed.lock().unwrap().clone()
    }
}

fn single(key: TestKey, work: impl Work<u32> + 'static) -> Arc<SingleTask<&'static str, u32>> {
    Arc::new(SingleTask::new(key, work))
}

fn observing(recording: &Arc<Recording>) -> Vec<Arc<dyn Observer<u32>>> {
    vec![Arc::clone(recording) as Arc<dyn Observer<u32>>]
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn execute_notifies_completion_and_retires() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    let key = TaskKey::simple("a");

    let exec = engine
        .execute(single(key.clone(), Produce(7)), observing(&obs))
        .unwrap();

    wait_until("completion", || obs.completions() == vec![7]).await;
    assert_eq!(exec.status(), TaskStatus::Completed);
    wait_until("retirement", || {
        engine.task_status(&key) == TaskStatus::NotStarted
    })
    .await;
    // One-shot bindings are dropped after notification.
    assert_eq!(engine.observers_bound(&key), 0);
}

#[tokio::test]
async fn execute_requires_at_least_one_observer() {
    let engine = TestEngine::new();
    let err = engine
        .execute(single(TaskKey::simple("a"), Produce(1)), Vec::new())
        .unwrap_err();
    assert!(matches!(err, SpindleError::NoObservers));
}

#[tokio::test]
async fn concurrent_execute_yields_one_record_and_one_firing() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    let key = TaskKey::simple("slow");

    let first = engine
        .execute(
            single(
                key.clone(),
                Slow {
                    delay: Duration::from_millis(100),
                    value: 1,
                },
            ),
            observing(&obs),
        )
        .unwrap();

    for _ in 0..8 {
        let joined = engine
            .execute(single(key.clone(), Produce(99)), observing(&obs))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &joined));
    }

    wait_until("single completion", || !obs.completions().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(obs.completions(), vec![1]);
}

#[tokio::test]
async fn one_shot_schedule_completes_with_produced_value() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    let key = TaskKey::simple("A");

    let exec = engine
        .schedule_once(
            Duration::from_millis(20),
            single(key.clone(), Produce(3)),
            observing(&obs),
        )
        .unwrap();
    assert_eq!(exec.status(), TaskStatus::Pending);
    assert_eq!(engine.task_status(&key), TaskStatus::Pending);

    wait_until("completion", || obs.completions() == vec![3]).await;
    assert_eq!(exec.status(), TaskStatus::Completed);
    assert_eq!(obs.cancellations(), 0);
    assert!(obs.failures().is_empty());
}

#[tokio::test]
async fn cancel_before_the_delay_elapses_notifies_cancellation() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    let key = TaskKey::simple("B");

    let exec = engine
        .schedule_once(
            Duration::from_millis(50),
            single(key.clone(), Produce(3)),
            observing(&obs),
        )
        .unwrap();

    engine.cancel(&key);
    assert!(engine.is_canceled(&key));
    // Idempotent: a second cancel has no further observable effect.
    engine.cancel(&key);

    wait_until("cancellation", || obs.cancellations() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(obs.cancellations(), 1);
    assert!(obs.completions().is_empty());
    assert_eq!(exec.status(), TaskStatus::Canceled);
}

#[tokio::test]
async fn zero_initial_delay_is_rejected() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    let err = engine
        .schedule_once(
            Duration::ZERO,
            single(TaskKey::simple("a"), Produce(1)),
            observing(&obs),
        )
        .unwrap_err();
    assert!(matches!(err, SpindleError::ZeroInitialDelay));
}

#[tokio::test]
async fn periodic_firings_are_separated_by_at_least_the_period() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    let key = TaskKey::simple("tick");
    let period = Duration::from_millis(30);

    let exec = engine
        .schedule(
            Duration::from_millis(20),
            period,
            single(key.clone(), Produce(1)),
            observing(&obs),
        )
        .unwrap();

    // Observers stay bound across firings of a repeating schedule.
    wait_until("three firings", || obs.completions().len() >= 3).await;
    assert!(Arc::ptr_eq(&exec, &engine.execution(&key).unwrap()));

    let stamps = obs.completed_at.lock().unwrap().clone();
    for pair in stamps.windows(2) {
        assert!(pair[1] - pair[0] >= period, "fixed-delay spacing violated");
    }

    engine.cancel(&key);
    wait_until("cancellation", || obs.cancellations() == 1).await;
    wait_until("retirement", || {
        engine.task_status(&key) == TaskStatus::NotStarted
    })
    .await;
}

#[tokio::test]
async fn failed_periodic_firing_continues_on_the_next_tick() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    let key = TaskKey::simple("flaky");

    engine
        .schedule(
            Duration::from_millis(20),
            Duration::from_millis(20),
            single(key.clone(), Fail("boom")),
            observing(&obs),
        )
        .unwrap();

    wait_until("two failures", || obs.failures().len() >= 2).await;
    assert_eq!(obs.failures()[0], "boom");
    engine.cancel(&key);
}

#[tokio::test]
async fn sibling_schedules_share_one_aggregate_record() {
    let engine = TestEngine::new();
    let obs1 = Arc::new(Recording::default());
    let obs2 = Arc::new(Recording::default());
    let unit1 = single(TaskKey::composite("G", ["1"]), Produce(1));
    let unit2 = single(TaskKey::composite("G", ["2"]), Produce(2));

    let rec1 = engine
        .schedule_once(Duration::from_millis(40), unit1, observing(&obs1))
        .unwrap();
    let rec2 = engine
        .schedule_once(Duration::from_millis(40), unit2, observing(&obs2))
        .unwrap();
    assert!(Arc::ptr_eq(&rec1, &rec2));
    assert!(Arc::ptr_eq(
        &rec1,
        &engine.execution(&TaskKey::simple("G")).unwrap()
    ));

    wait_until("both members complete", || {
        obs1.completions() == vec![1] && obs2.completions() == vec![2]
    })
    .await;
}

#[tokio::test]
async fn a_member_failure_never_stops_its_siblings() {
    let engine = TestEngine::new();
    let failing = Arc::new(Recording::default());
    let healthy = Arc::new(Recording::default());

    engine
        .schedule_once(
            Duration::from_millis(20),
            single(TaskKey::composite("G", ["bad"]), Fail("boom")),
            observing(&failing),
        )
        .unwrap();
    engine
        .schedule_once(
            Duration::from_millis(20),
            single(TaskKey::composite("G", ["good"]), Produce(2)),
            observing(&healthy),
        )
        .unwrap();

    wait_until("isolated outcomes", || {
        failing.failures() == vec!["boom".to_string()] && healthy.completions() == vec![2]
    })
    .await;
    assert_eq!(failing.completions(), Vec::<u32>::new());
    assert_eq!(healthy.failures(), Vec::<String>::new());
}

#[tokio::test]
async fn canceling_the_aggregate_cancels_every_member() {
    let engine = TestEngine::new();
    let obs1 = Arc::new(Recording::default());
    let obs2 = Arc::new(Recording::default());

    let rec = engine
        .schedule_once(
            Duration::from_millis(40),
            single(TaskKey::composite("G", ["1"]), Produce(1)),
            observing(&obs1),
        )
        .unwrap();
    engine
        .schedule_once(
            Duration::from_millis(40),
            single(TaskKey::composite("G", ["2"]), Produce(2)),
            observing(&obs2),
        )
        .unwrap();

    engine.cancel(&TaskKey::simple("G"));

    wait_until("both members canceled", || {
        obs1.cancellations() == 1 && obs2.cancellations() == 1
    })
    .await;
    assert_eq!(rec.status(), TaskStatus::Canceled);
    assert!(obs1.completions().is_empty() && obs2.completions().is_empty());
}

#[tokio::test]
async fn canceling_one_sibling_leaves_the_other_running() {
    let engine = TestEngine::new();
    let obs1 = Arc::new(Recording::default());
    let obs2 = Arc::new(Recording::default());
    let unit1 = single(TaskKey::composite("G", ["1"]), Produce(1));
    let unit2 = single(TaskKey::composite("G", ["2"]), Produce(2));

    engine
        .schedule_once(Duration::from_millis(40), unit1, observing(&obs1))
        .unwrap();
    engine
        .schedule_once(Duration::from_millis(40), Arc::clone(&unit2), observing(&obs2))
        .unwrap();

    unit2.cancel();

    wait_until("split outcomes", || {
        obs1.completions() == vec![1] && obs2.cancellations() == 1
    })
    .await;
    assert!(obs2.completions().is_empty());
}

#[tokio::test]
async fn rescheduling_a_live_key_replaces_the_old_schedule() {
    let engine = TestEngine::new();
    let old_obs = Arc::new(Recording::default());
    let new_obs = Arc::new(Recording::default());
    let key = TaskKey::simple("R");

    let old = engine
        .schedule_once(
            Duration::from_millis(60),
            single(key.clone(), Produce(1)),
            observing(&old_obs),
        )
        .unwrap();
    let new = engine
        .schedule_once(
            Duration::from_millis(20),
            single(key.clone(), Produce(2)),
            observing(&new_obs),
        )
        .unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert!(old.is_canceled());

    wait_until("new schedule fires", || new_obs.completions() == vec![2]).await;
    // Give the replaced driver's original deadline time to pass: it must
    // stand down without notifying anyone.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(old_obs.completions().is_empty());
    assert_eq!(old_obs.cancellations(), 0);
}

#[tokio::test]
async fn queries_on_an_unknown_key_yield_defaults() {
    let engine = TestEngine::new();
    let key = TaskKey::simple("nope");
    assert_eq!(engine.task_status(&key), TaskStatus::NotStarted);
    assert!(!engine.is_canceled(&key));
    assert!(!engine.is_done(&key));
    assert!(engine.execution(&key).is_none());
}

#[tokio::test]
async fn counts_reflect_live_records_and_serialize() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    engine
        .schedule_once(
            Duration::from_millis(500),
            single(TaskKey::simple("p"), Produce(1)),
            observing(&obs),
        )
        .unwrap();

    let counts = engine.counts_by_status();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.total(), 1);

    let json = serde_json::to_value(&counts).unwrap();
    assert_eq!(json["pending"], 1);
    assert_eq!(json["completed"], 0);

    engine.shutdown();
}

#[tokio::test]
async fn fan_in_ceiling_breach_fails_the_firing_and_sweeps_state() {
    let engine: TestEngine = Engine::with_config(
        EngineConfig::new().with_fan_in_ceiling(Duration::from_millis(40)),
    );
    let obs = Arc::new(Recording::default());
    let member_key = TaskKey::composite("G", ["stuck"]);

    let rec = engine
        .schedule_once(
            Duration::from_millis(10),
            single(
                member_key.clone(),
                Slow {
                    delay: Duration::from_secs(5),
                    value: 1,
                },
            ),
            observing(&obs),
        )
        .unwrap();

    wait_until("sweep", || {
        engine.task_status(&TaskKey::simple("G")) == TaskStatus::NotStarted
            && engine.task_status(&member_key) == TaskStatus::NotStarted
    })
    .await;
    // Engine-level failure, not a member outcome: nobody is notified.
    assert!(obs.completions().is_empty());
    assert!(obs.failures().is_empty());
    assert_eq!(obs.cancellations(), 0);
    // The aggregate record itself never takes a terminal status here.
    assert_eq!(rec.status(), TaskStatus::Started);
}

#[tokio::test]
async fn a_simple_schedule_and_a_composite_major_track_separate_records() {
    let engine = TestEngine::new();
    let simple_obs = Arc::new(Recording::default());
    let member_obs = Arc::new(Recording::default());
    let simple_key = TaskKey::simple("G");

    let simple = engine
        .schedule(
            Duration::from_millis(20),
            Duration::from_millis(20),
            single(simple_key.clone(), Produce(1)),
            observing(&simple_obs),
        )
        .unwrap();
    let aggregate = engine
        .schedule_once(
            Duration::from_millis(20),
            single(TaskKey::composite("G", ["1"]), Produce(2)),
            observing(&member_obs),
        )
        .unwrap();

    // Sharing a major value does not merge the identities: the member
    // fires under its own aggregate record.
    assert!(!Arc::ptr_eq(&simple, &aggregate));
    wait_until("member firing", || member_obs.completions() == vec![2]).await;
    wait_until("simple firing", || !simple_obs.completions().is_empty()).await;
    assert!(!simple.is_canceled());
    engine.cancel(&simple_key);
}

#[tokio::test]
async fn a_simple_schedule_never_replaces_a_live_aggregate() {
    let engine = TestEngine::new();
    let member_obs = Arc::new(Recording::default());
    let simple_obs = Arc::new(Recording::default());

    let aggregate = engine
        .schedule_once(
            Duration::from_millis(40),
            single(TaskKey::composite("H", ["1"]), Produce(1)),
            observing(&member_obs),
        )
        .unwrap();
    engine
        .schedule_once(
            Duration::from_millis(40),
            single(TaskKey::simple("H"), Produce(2)),
            observing(&simple_obs),
        )
        .unwrap();

    assert!(!aggregate.is_canceled());
    wait_until("both firings", || {
        member_obs.completions() == vec![1] && simple_obs.completions() == vec![2]
    })
    .await;
}

#[tokio::test]
async fn a_driver_armed_after_shutdown_stands_down() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());
    engine.shutdown();

    engine
        .schedule_once(
            Duration::from_millis(10),
            single(TaskKey::simple("late"), Produce(1)),
            observing(&obs),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(obs.completions().is_empty());
}

#[tokio::test]
async fn shutdown_stands_periodic_drivers_down() {
    let engine = TestEngine::new();
    let obs = Arc::new(Recording::default());

    engine
        .schedule(
            Duration::from_millis(10),
            Duration::from_millis(10),
            single(TaskKey::simple("tick"), Produce(1)),
            observing(&obs),
        )
        .unwrap();

    wait_until("first firing", || !obs.completions().is_empty()).await;
    engine.shutdown();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_shutdown = obs.completions().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(obs.completions().len(), after_shutdown);
}
