// crates/core/tests/work_queue.rs

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use codematch_core::config::QueueConfig;
use codematch_core::queue::{JobStatus, QueueError, QueueStats, WorkQueue};
use serde_json::{json, Value};
use tempfile::tempdir;

fn queue_at(path: &Path, consumer: &str) -> WorkQueue {
    let mut config = QueueConfig::new(path);
    config.consumer_id = Some(consumer.to_string());
    WorkQueue::open(&config).expect("open queue")
}

#[derive(Debug)]
enum WorkError {
    Failed,
    Queue(QueueError),
}

impl From<QueueError> for WorkError {
    fn from(err: QueueError) -> Self {
        WorkError::Queue(err)
    }
}

#[test]
fn put_then_next_returns_payload() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");

    let payload = json!({"context_id": "alpha", "data": [1, 2, 3]});
    queue.put_default(&payload).expect("put");
    let job = queue.next().expect("next").expect("job");
    assert_eq!(job.payload(), &payload);
    assert_eq!(job.attempts_left(), queue.max_attempts());
    assert!(queue.next().expect("next").is_none());
}

#[test]
fn empty_queue_yields_nothing() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    assert!(queue.next().expect("next").is_none());
    assert_eq!(queue.stats().expect("stats"), QueueStats::default());
}

#[test]
fn higher_priority_first_then_insertion_order() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    queue.put(&json!({"name": "alice"}), 1).expect("put");
    queue.put(&json!({"name": "bob"}), 2).expect("put");
    queue.put(&json!({"name": "mike"}), 0).expect("put");
    queue.put(&json!({"name": "carol"}), 1).expect("put");

    let mut names = Vec::new();
    while let Some(job) = queue.next().expect("next") {
        names.push(job.payload()["name"].as_str().expect("name").to_string());
    }
    assert_eq!(names, ["bob", "alice", "carol", "mike"]);
}

#[test]
fn complete_deletes_and_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    let id = queue.put_default(&json!({"n": 1})).expect("put");
    assert_eq!(queue.size().expect("size"), 1);

    let job = queue.next().expect("next").expect("job");
    job.complete().expect("complete");
    job.complete().expect("complete again");
    assert_eq!(queue.size().expect("size"), 0);
    assert_eq!(queue.get(id).expect("get"), None);
    assert_eq!(queue.stats().expect("stats").total, 0);
}

#[test]
fn release_spends_one_attempt_until_exhausted() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    let id = queue.put_default(&json!({"n": 1})).expect("put");
    let max = queue.max_attempts();

    for expected in (1..max).rev() {
        let job = queue.next().expect("next").expect("job is claimable");
        assert_eq!(job.release().expect("release"), Some(expected));
        let record = queue.get(id).expect("get").expect("kept");
        assert_eq!(record.status, JobStatus::Available);
        assert_eq!(record.attempts_left, expected);
        assert_eq!(record.locked_by, None);
    }

    // The last release leaves the job held by us.
    let job = queue.next().expect("next").expect("last attempt");
    assert_eq!(job.release().expect("release"), Some(0));
    let record = queue.get(id).expect("get").expect("kept");
    assert_eq!(record.status, JobStatus::Locked);
    assert_eq!(record.attempts_left, 0);
    assert_eq!(record.locked_by.as_deref(), Some("consumer_1"));
    assert!(queue.next().expect("next").is_none());

    assert!(job.error("gave up").expect("error"));
    let record = queue.get(id).expect("get").expect("kept");
    assert_eq!(record.status, JobStatus::Errored);
    assert_eq!(record.error_message.as_deref(), Some("gave up"));
}

#[test]
fn errored_jobs_are_retained_but_not_available() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    for i in 0..5 {
        queue.put_default(&json!({"n": i})).expect("put");
    }
    let job = queue.next().expect("next").expect("job");
    assert!(job.error("problem").expect("error"));

    let stats = queue.stats().expect("stats");
    assert_eq!(stats, QueueStats { available: 4, total: 5, locked: 0, errors: 1 });
}

#[test]
fn scope_completes_on_success() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    queue.put_default(&json!({"foobar": 1})).expect("put");

    let job = queue.next().expect("next").expect("job");
    let seen: Result<i64, WorkError> =
        job.scope(|payload| Ok(payload["foobar"].as_i64().unwrap_or_default()));
    assert_eq!(seen.expect("scope"), 1);
    assert!(queue.next().expect("next").is_none());
    assert_eq!(queue.stats().expect("stats").total, 0);
}

#[test]
fn scope_releases_on_error() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    queue.put_default(&json!({"foobar": 1})).expect("put");

    let job = queue.next().expect("next").expect("job");
    let outcome: Result<(), WorkError> = job.scope(|_| Err(WorkError::Failed));
    assert!(matches!(outcome, Err(WorkError::Failed)));

    let job = queue.next().expect("next").expect("job is available again");
    assert_eq!(job.attempts_left(), queue.max_attempts() - 1);
}

#[test]
fn scope_returns_the_work_error_when_release_fails() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue.db");
    let queue = queue_at(&path, "consumer_1");
    queue.put_default(&json!({"foobar": 1})).expect("put");

    let job = queue.next().expect("next").expect("job");
    let outcome: Result<(), WorkError> = job.scope(|_| {
        let conn = rusqlite::Connection::open(&path).expect("open");
        conn.execute_batch("DROP TABLE jobs").expect("drop");
        Err(WorkError::Failed)
    });
    assert!(matches!(outcome, Err(WorkError::Failed)));
}

#[test]
fn scope_releases_on_panic() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    queue.put_default(&json!({"foobar": 1})).expect("put");

    let result = catch_unwind(AssertUnwindSafe(|| {
        let job = queue.next().expect("next").expect("job");
        let _: Result<(), WorkError> = job.scope(|_| panic!("worker crashed"));
    }));
    assert!(result.is_err());

    let job = queue.next().expect("next").expect("job is available again");
    assert_eq!(job.attempts_left(), queue.max_attempts() - 1);
}

#[test]
fn process_next_runs_the_highest_priority_job() {
    let dir = tempdir().expect("tempdir");
    let queue = queue_at(&dir.path().join("queue.db"), "consumer_1");
    queue.put(&json!({"n": 1}), 0).expect("put");
    queue.put(&json!({"n": 2}), 9).expect("put");

    let got: Option<Value> =
        queue.process_next(|payload| Ok::<_, WorkError>(payload["n"].clone())).expect("process");
    assert_eq!(got, Some(json!(2)));
    assert_eq!(queue.size().expect("size"), 1);

    queue.clear().expect("clear");
    let got: Option<()> = queue.process_next(|_| Ok::<_, WorkError>(())).expect("process");
    assert!(got.is_none());
}

#[test]
fn two_consumers_never_share_a_job() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue.db");
    let producer = queue_at(&path, "producer");
    for i in 0..40 {
        producer.put(&json!({"n": i}), i % 3).expect("put");
    }

    let workers: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|name| {
            let path = path.clone();
            std::thread::spawn(move || {
                let queue = queue_at(&path, name);
                let mut claimed = Vec::new();
                while let Some(job) = queue.next().expect("next") {
                    claimed.push(job.payload()["n"].as_i64().expect("n"));
                    job.complete().expect("complete");
                }
                claimed
            })
        })
        .collect();

    let mut all: Vec<i64> =
        workers.into_iter().flat_map(|worker| worker.join().expect("worker")).collect();
    all.sort_unstable();
    assert_eq!(all, (0..40).collect::<Vec<i64>>());
    assert_eq!(producer.stats().expect("stats").total, 0);
}

#[test]
fn expired_lease_is_reclaimable_without_spending_attempts() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue.db");
    let mut config = QueueConfig::new(&path);
    config.lease_timeout_secs = 0;
    config.consumer_id = Some("crashed".to_string());
    let crashed = WorkQueue::open(&config).expect("open");
    config.consumer_id = Some("survivor".to_string());
    let survivor = WorkQueue::open(&config).expect("open");

    let id = crashed.put_default(&json!({"n": 1})).expect("put");
    let lost = crashed.next().expect("next").expect("job");

    let job = survivor.next().expect("next").expect("expired lease is claimable");
    assert_eq!(job.id(), id);
    assert_eq!(job.attempts_left(), crashed.max_attempts());

    // The old holder can no longer settle the job.
    lost.complete().expect("stale complete");
    assert_eq!(lost.release().expect("stale release"), None);
    let record = survivor.get(id).expect("get").expect("kept");
    assert_eq!(record.locked_by.as_deref(), Some("survivor"));

    job.complete().expect("complete");
    assert_eq!(survivor.get(id).expect("get"), None);
}

#[test]
fn default_config_handles_never_settle_each_others_leases() {
    let dir = tempdir().expect("tempdir");
    let mut config = QueueConfig::new(dir.path().join("queue.db"));
    config.lease_timeout_secs = 0;
    let first = WorkQueue::open(&config).expect("open");
    let second = WorkQueue::open(&config).expect("open");
    assert_ne!(first.consumer_id(), second.consumer_id());

    let id = first.put_default(&json!({"n": 1})).expect("put");
    let stale = first.next().expect("next").expect("job");
    let live = second.next().expect("next").expect("reclaimed");
    assert_eq!(live.id(), id);

    stale.complete().expect("stale complete");
    let record = second.get(id).expect("get").expect("still queued");
    assert_eq!(record.locked_by.as_deref(), Some(second.consumer_id()));
    live.complete().expect("complete");
    assert_eq!(second.get(id).expect("get"), None);
}

#[test]
fn reclaimed_job_rejects_the_previous_lease_of_the_same_consumer() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue.db");
    let mut config = QueueConfig::new(&path);
    config.lease_timeout_secs = 0;
    config.consumer_id = Some("shared".to_string());
    let first = WorkQueue::open(&config).expect("open");
    let second = WorkQueue::open(&config).expect("open");

    let id = first.put_default(&json!({"n": 1})).expect("put");
    let stale = first.next().expect("next").expect("job");
    // Leases are stamped in milliseconds.
    std::thread::sleep(std::time::Duration::from_millis(5));
    let live = second.next().expect("next").expect("reclaimed");

    stale.complete().expect("stale complete");
    assert!(!stale.error("late").expect("stale error"));
    assert_eq!(stale.release().expect("stale release"), None);
    let record = second.get(id).expect("get").expect("still queued");
    assert_eq!(record.status, JobStatus::Locked);
    assert_eq!(record.attempts_left, second.max_attempts());

    assert!(live.error("boom").expect("error"));
    assert_eq!(second.get(id).expect("get").expect("kept").status, JobStatus::Errored);
}

#[test]
fn repair_returns_expired_leases() {
    let dir = tempdir().expect("tempdir");
    let mut config = QueueConfig::new(dir.path().join("queue.db"));
    config.lease_timeout_secs = 0;
    let queue = WorkQueue::open(&config).expect("open");

    queue.put_default(&json!({"n": 1})).expect("put");
    let job = queue.next().expect("next").expect("job");
    assert_eq!(queue.stats().expect("stats").locked, 1);

    assert_eq!(queue.repair().expect("repair"), 1);
    let stats = queue.stats().expect("stats");
    assert_eq!((stats.available, stats.locked), (1, 0));
    let record = queue.get(job.id()).expect("get").expect("kept");
    assert_eq!(record.attempts_left, queue.max_attempts());
}

#[test]
fn collections_in_one_file_are_independent() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue.db");
    let jobs = queue_at(&path, "c");
    let mut config = QueueConfig::new(&path);
    config.collection = "matching".to_string();
    let matching = WorkQueue::open(&config).expect("open");

    jobs.put_default(&json!("a")).expect("put");
    assert_eq!(matching.size().expect("size"), 0);
    assert_eq!(matching.collection(), "matching");
    assert!(matching.next().expect("next").is_none());
}

#[test]
fn invalid_collection_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let mut config = QueueConfig::new(dir.path().join("queue.db"));
    config.collection = "jobs; DROP TABLE jobs".to_string();
    assert!(matches!(WorkQueue::open(&config), Err(QueueError::InvalidCollection(_))));
}
