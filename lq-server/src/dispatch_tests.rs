use std::sync::Mutex;
use std::time::{Duration, Instant};

use lq_core::HISTOGRAM_SEGMENTS;
use lq_net::NetError;
use lq_proto::{Command, Job, JobResult};

use crate::dispatch::{CommandSink, CompleteOutcome, Dispatcher};

const INTERVAL: Duration = Duration::from_secs(5);

/// Records every command instead of touching a socket.
#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(String, Command)>>,
    fail: bool,
}

impl RecordingSink {
    fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn sent_to(&self, identity: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == identity)
            .count()
    }
}

impl CommandSink for RecordingSink {
    fn send_command(&self, identity: &str, command: &Command) -> Result<(), NetError> {
        if self.fail {
            return Err(NetError::UnknownPeer(identity.to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((identity.to_string(), command.clone()));
        Ok(())
    }
}

fn histogram_job(name: &str) -> Job {
    Job::Histogram {
        filename: name.to_string(),
    }
}

fn histogram_result(name: &str) -> JobResult {
    JobResult::Histogram {
        filename: name.to_string(),
        histogram: [0.0; HISTOGRAM_SEGMENTS],
    }
}

fn jobs(n: usize) -> Vec<Job> {
    (0..n).map(|i| histogram_job(&format!("img_{i:03}.png"))).collect()
}

#[test]
fn dispatch_respects_the_backlog_cap() {
    let dispatcher = Dispatcher::new(4, INTERVAL);
    let sink = RecordingSink::default();

    dispatcher.enqueue(jobs(10));
    dispatcher.register_worker("AAAAA", 8, Instant::now());

    let sent = dispatcher.dispatch("AAAAA", &sink);
    assert_eq!(sent.len(), 4);
    assert_eq!(dispatcher.backlog_len("AAAAA"), Some(4));
    assert_eq!(dispatcher.pending_jobs(), 6);

    // At the cap a further dispatch is a no-op.
    assert!(dispatcher.dispatch("AAAAA", &sink).is_empty());
    assert_eq!(sink.sent_to("AAAAA"), 4);
}

#[test]
fn job_census_is_conserved_through_dispatch_and_completion() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let sink = RecordingSink::default();
    let total = 20usize;

    dispatcher.enqueue(jobs(total));
    dispatcher.register_worker("AAAAA", 4, Instant::now());
    dispatcher.register_worker("BBBBB", 4, Instant::now());
    dispatcher.dispatch("AAAAA", &sink);
    dispatcher.dispatch("BBBBB", &sink);

    let mut completed = 0usize;
    assert_eq!(
        dispatcher.pending_jobs() + dispatcher.in_flight_jobs() + completed,
        total
    );

    for i in 0..3 {
        let result = histogram_result(&format!("img_{i:03}.png"));
        assert_eq!(
            dispatcher.complete("AAAAA", &result),
            CompleteOutcome::Accepted
        );
        completed += 1;
        dispatcher.dispatch("AAAAA", &sink);
        assert_eq!(
            dispatcher.pending_jobs() + dispatcher.in_flight_jobs() + completed,
            total
        );
    }
}

#[test]
fn completion_removes_only_the_matching_entry() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let sink = RecordingSink::default();

    dispatcher.enqueue(jobs(3));
    dispatcher.register_worker("AAAAA", 1, Instant::now());
    dispatcher.dispatch("AAAAA", &sink);
    assert_eq!(dispatcher.backlog_len("AAAAA"), Some(3));

    assert_eq!(
        dispatcher.complete("AAAAA", &histogram_result("img_001.png")),
        CompleteOutcome::Accepted
    );
    assert_eq!(dispatcher.backlog_len("AAAAA"), Some(2));

    // Same result again: nothing left to match.
    assert_eq!(
        dispatcher.complete("AAAAA", &histogram_result("img_001.png")),
        CompleteOutcome::NoMatchingJob
    );
}

#[test]
fn results_from_unregistered_workers_are_rejected() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    assert_eq!(
        dispatcher.complete("ZZZZZ", &histogram_result("img_000.png")),
        CompleteOutcome::UnknownWorker
    );
}

#[test]
fn releasing_a_worker_requeues_its_backlog_exactly_once() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let sink = RecordingSink::default();
    let total = 8usize;

    dispatcher.enqueue(jobs(total));
    dispatcher.register_worker("AAAAA", 4, Instant::now());
    dispatcher.dispatch("AAAAA", &sink);
    assert_eq!(dispatcher.pending_jobs(), 0);

    let requeued = dispatcher.release_worker("AAAAA").unwrap();
    assert_eq!(requeued, total);
    assert_eq!(dispatcher.pending_jobs(), total);
    assert_eq!(dispatcher.worker_count(), 0);

    // Unknown after release.
    assert!(dispatcher.release_worker("AAAAA").is_none());
}

#[test]
fn reannouncing_an_identity_does_not_lose_jobs() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let sink = RecordingSink::default();

    dispatcher.enqueue(jobs(5));
    dispatcher.register_worker("AAAAA", 4, Instant::now());
    dispatcher.dispatch("AAAAA", &sink);
    assert_eq!(dispatcher.pending_jobs(), 0);

    dispatcher.register_worker("AAAAA", 4, Instant::now());
    assert_eq!(dispatcher.backlog_len("AAAAA"), Some(0));
    assert_eq!(dispatcher.pending_jobs(), 5);
}

#[test]
fn failed_sends_return_the_job_to_the_queue() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let failing = RecordingSink::failing();

    dispatcher.enqueue(jobs(3));
    dispatcher.register_worker("AAAAA", 4, Instant::now());

    let sent = dispatcher.dispatch("AAAAA", &failing);
    assert!(sent.is_empty());
    // The failed job rolled back out of the backlog; nothing is stranded
    // on a worker that never received it.
    assert_eq!(dispatcher.backlog_len("AAAAA"), Some(0));
    assert_eq!(dispatcher.pending_jobs(), 3);

    // Once the transport works, a later pass dispatches everything in the
    // original order.
    let sink = RecordingSink::default();
    let sent = dispatcher.dispatch("AAAAA", &sink);
    let names: Vec<_> = sent.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(names, ["img_000.png", "img_001.png", "img_002.png"]);
}

#[test]
fn sweep_dismisses_only_strictly_late_workers() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let start = Instant::now();

    dispatcher.enqueue(jobs(2));
    dispatcher.register_worker("LATE1", 1, start);
    dispatcher.register_worker("ALIVE", 1, start);
    dispatcher.heartbeat_reply("ALIVE");

    // Exactly at the boundary nothing happens.
    let outcome = dispatcher.sweep(start + INTERVAL);
    assert!(outcome.dismissed.is_empty());
    assert!(outcome.heartbeat_due.is_empty());

    // Strictly past it: the silent worker is dismissed, the live one gets a
    // fresh request.
    let outcome = dispatcher.sweep(start + INTERVAL + Duration::from_millis(1));
    assert_eq!(outcome.dismissed.len(), 1);
    assert_eq!(outcome.dismissed[0].0, "LATE1");
    assert_eq!(outcome.heartbeat_due, vec!["ALIVE".to_string()]);
    assert_eq!(dispatcher.worker_count(), 1);
}

#[test]
fn dismissed_backlogs_land_back_on_the_queue() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let sink = RecordingSink::default();
    let start = Instant::now();

    dispatcher.enqueue(jobs(6));
    dispatcher.register_worker("DEAD1", 4, start);
    dispatcher.dispatch("DEAD1", &sink);
    assert_eq!(dispatcher.pending_jobs(), 0);

    let outcome = dispatcher.sweep(start + INTERVAL + Duration::from_millis(1));
    assert_eq!(outcome.dismissed, vec![("DEAD1".to_string(), 6)]);
    assert_eq!(dispatcher.pending_jobs(), 6);
    assert_eq!(dispatcher.in_flight_jobs(), 0);
}

#[test]
fn renewed_requests_reset_the_reply_flag() {
    let dispatcher = Dispatcher::new(32, INTERVAL);
    let start = Instant::now();

    dispatcher.register_worker("AAAAA", 1, start);
    dispatcher.heartbeat_reply("AAAAA");

    let first = start + INTERVAL + Duration::from_millis(1);
    let outcome = dispatcher.sweep(first);
    assert_eq!(outcome.heartbeat_due, vec!["AAAAA".to_string()]);

    // No reply since the renewed request: the next late sweep dismisses.
    let outcome = dispatcher.sweep(first + INTERVAL + Duration::from_millis(1));
    assert_eq!(outcome.dismissed.len(), 1);
}
