//! The dispatch core: pending-job queue plus per-worker backlog accounting.
//!
//! Locking is deliberately non-reentrant with a fixed order: the queue
//! mutex is always taken before the worker mutex when both are needed, and
//! nothing is sent over the network while either lock is held. Dismissal is
//! a locked re-queue step followed by an unlocked send step at the caller.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lq_net::NetError;
use lq_proto::{encode_command, Command, Job, JobResult};

/// Where outgoing commands go. The engine hands the work or control router
/// in; unit tests substitute a recorder.
pub trait CommandSink {
    fn send_command(&self, identity: &str, command: &Command) -> Result<(), NetError>;
}

impl CommandSink for lq_net::Router {
    fn send_command(&self, identity: &str, command: &Command) -> Result<(), NetError> {
        let payload = encode_command(command).map_err(|e| {
            NetError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        self.send(identity, &payload)
    }
}

/// Server-side record of one connected worker.
#[derive(Debug)]
pub struct WorkerEntry {
    pub backlog: Vec<Job>,
    pub last_heartbeat_request: Instant,
    pub heartbeat_reply_received: bool,
    pub concurrency: u32,
}

/// What happened to an incoming result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Matched and removed a backlog entry.
    Accepted,
    /// No worker with that identity is registered.
    UnknownWorker,
    /// The worker is known but nothing in its backlog matches.
    NoMatchingJob,
}

/// Liveness decisions from one sweep; the caller performs the sends.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Workers dismissed for missing a heartbeat, with the number of jobs
    /// each returned to the queue.
    pub dismissed: Vec<(String, usize)>,
    /// Workers due a fresh heartbeat request.
    pub heartbeat_due: Vec<String>,
}

pub struct Dispatcher {
    queue: Mutex<VecDeque<Job>>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    max_backlog: usize,
    heartbeat_interval: Duration,
}

impl Dispatcher {
    pub fn new(max_backlog: usize, heartbeat_interval: Duration) -> Self {
        assert!(max_backlog > 0, "worker backlog cap must be positive");
        Self {
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(HashMap::new()),
            max_backlog,
            heartbeat_interval,
        }
    }

    pub fn enqueue(&self, jobs: impl IntoIterator<Item = Job>) {
        self.queue.lock().unwrap().extend(jobs);
    }

    pub fn pending_jobs(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Jobs currently sitting in worker backlogs.
    pub fn in_flight_jobs(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.backlog.len())
            .sum()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn identities(&self) -> Vec<String> {
        self.workers.lock().unwrap().keys().cloned().collect()
    }

    pub fn backlog_len(&self, identity: &str) -> Option<usize> {
        self.workers
            .lock()
            .unwrap()
            .get(identity)
            .map(|entry| entry.backlog.len())
    }

    /// Insert a fresh worker record. A re-announcing identity returns its
    /// old backlog to the queue first so no job is lost.
    pub fn register_worker(&self, identity: &str, concurrency: u32, now: Instant) {
        let mut queue = self.queue.lock().unwrap();
        let mut workers = self.workers.lock().unwrap();
        let previous = workers.insert(
            identity.to_string(),
            WorkerEntry {
                backlog: Vec::new(),
                last_heartbeat_request: now,
                heartbeat_reply_received: false,
                concurrency,
            },
        );
        if let Some(previous) = previous {
            queue.extend(previous.backlog);
        }
    }

    pub fn heartbeat_reply(&self, identity: &str) {
        if let Some(entry) = self.workers.lock().unwrap().get_mut(identity) {
            entry.heartbeat_reply_received = true;
        }
    }

    /// Feed a worker jobs until its backlog hits the cap or the queue runs
    /// dry. Returns `(kind, filename)` of every job actually sent.
    pub fn dispatch(
        &self,
        identity: &str,
        sink: &dyn CommandSink,
    ) -> Vec<(&'static str, String)> {
        let mut sent = Vec::new();
        loop {
            let job = {
                let mut queue = self.queue.lock().unwrap();
                let mut workers = self.workers.lock().unwrap();
                let Some(entry) = workers.get_mut(identity) else {
                    break;
                };
                if entry.backlog.len() >= self.max_backlog || queue.is_empty() {
                    break;
                }
                let job = queue.pop_front().expect("queue checked non-empty");
                entry.backlog.push(job.clone());
                job
            };

            let descriptor = (job.kind(), job.filename().to_string());
            let command = Command::Job(job);
            match sink.send_command(identity, &command) {
                Ok(()) => sent.push(descriptor),
                Err(e) => {
                    eprintln!("lq-server: job send to {identity} failed: {e}");
                    if let Command::Job(job) = command {
                        self.roll_back(identity, job);
                    }
                    break;
                }
            }
        }
        sent
    }

    /// Undo a dispatch whose send failed: the job leaves the worker's
    /// backlog and returns to the front of the queue, where the next
    /// dispatch pass retries it. A worker sent nothing must not hold jobs
    /// hostage in a backlog only a dismissal would drain.
    fn roll_back(&self, identity: &str, job: Job) {
        let mut queue = self.queue.lock().unwrap();
        let mut workers = self.workers.lock().unwrap();
        if let Some(entry) = workers.get_mut(identity) {
            if let Some(index) = entry.backlog.iter().rposition(|queued| queued == &job) {
                entry.backlog.remove(index);
                queue.push_front(job);
            }
        }
    }

    /// Dispatch to every registered worker.
    pub fn dispatch_all(&self, sink: &dyn CommandSink) -> usize {
        let mut total = 0;
        for identity in self.identities() {
            total += self.dispatch(&identity, sink).len();
        }
        total
    }

    /// Record an arriving result against the sending worker's backlog.
    pub fn complete(&self, identity: &str, result: &JobResult) -> CompleteOutcome {
        let mut workers = self.workers.lock().unwrap();
        let Some(entry) = workers.get_mut(identity) else {
            return CompleteOutcome::UnknownWorker;
        };
        match entry
            .backlog
            .iter()
            .position(|job| result.matches_job(job))
        {
            Some(index) => {
                entry.backlog.remove(index);
                CompleteOutcome::Accepted
            }
            None => CompleteOutcome::NoMatchingJob,
        }
    }

    /// Erase a worker, returning its backlog to the queue. Returns the
    /// number of re-queued jobs, or `None` for an unknown identity.
    pub fn release_worker(&self, identity: &str) -> Option<usize> {
        let mut queue = self.queue.lock().unwrap();
        let mut workers = self.workers.lock().unwrap();
        let entry = workers.remove(identity)?;
        let requeued = entry.backlog.len();
        queue.extend(entry.backlog);
        Some(requeued)
    }

    /// One liveness pass. Strictly-greater-than the interval triggers
    /// action; exactly at the boundary does nothing.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut dead = Vec::new();
        {
            let mut workers = self.workers.lock().unwrap();
            for (identity, entry) in workers.iter_mut() {
                let elapsed = now.saturating_duration_since(entry.last_heartbeat_request);
                if elapsed <= self.heartbeat_interval {
                    continue;
                }
                if entry.heartbeat_reply_received {
                    entry.heartbeat_reply_received = false;
                    entry.last_heartbeat_request = now;
                    outcome.heartbeat_due.push(identity.clone());
                } else {
                    dead.push(identity.clone());
                }
            }
        }
        for identity in dead {
            if let Some(requeued) = self.release_worker(&identity) {
                outcome.dismissed.push((identity, requeued));
            }
        }
        outcome
    }
}
