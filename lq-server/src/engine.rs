//! The serving engine: wraps the dispatch core with the two routers, the
//! receive loops for both waves, and output persistence.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use lq_core::histogram::Histogram;
use lq_core::matching::{equalisation_mapping, identity_mapping, MatchError};
use lq_core::{COMMUNICATION_PORT, MAX_HEARTBEAT_INTERVAL, MAX_WORKER_QUEUE, WORK_PORT};
use lq_logging::{
    now_ms, FrameDroppedV1, ResultAcceptedV1, RunLog, ServerListeningV1, WaveFinishedV1,
    WaveStartedV1, WorkerDismissedV1, WorkerJoinedV1,
};
use lq_net::{NetError, RecvError, Router, RouterEvent};
use lq_proto::{decode_command, Command, HeartbeatKind, Job, JobResult, KIND_EQUALISATION, KIND_HISTOGRAM};

use crate::dispatch::{CommandSink, CompleteOutcome, Dispatcher};

/// How wave 2 orders images when pairing neighbours.
#[derive(Clone)]
pub enum FileOrdering {
    /// Bytewise filename order (the default).
    Lexicographic,
    /// Caller-supplied comparator, e.g. for a capture-time ordering.
    Custom(Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>),
}

impl FileOrdering {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            FileOrdering::Lexicographic => a.as_bytes().cmp(b.as_bytes()),
            FileOrdering::Custom(compare) => compare(a, b),
        }
    }
}

impl fmt::Debug for FileOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOrdering::Lexicographic => f.write_str("Lexicographic"),
            FileOrdering::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind both routers on. IPv6-capable by default.
    pub bind_host: String,
    /// Work channel port; 0 binds an ephemeral port.
    pub work_port: u16,
    /// Control channel port; 0 binds an ephemeral port.
    pub comm_port: u16,
    pub heartbeat_interval: Duration,
    pub max_worker_queue: usize,
    pub ordering: FileOrdering,
    /// Where `<basename>.tiff` outputs land.
    pub output_dir: PathBuf,
    /// Optional NDJSON run-event log.
    pub log_path: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_host: "::".to_string(),
            work_port: WORK_PORT,
            comm_port: COMMUNICATION_PORT,
            heartbeat_interval: MAX_HEARTBEAT_INTERVAL,
            max_worker_queue: MAX_WORKER_QUEUE,
            ordering: FileOrdering::Lexicographic,
            output_dir: PathBuf::from("."),
            log_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind listening socket: {0}")]
    Bind(NetError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Match(#[from] MatchError),
}

#[derive(Debug)]
pub struct ServeSummary {
    pub images: usize,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaveKind {
    Histogram,
    Equalisation,
}

impl WaveKind {
    fn expected_kind(self) -> &'static str {
        match self {
            WaveKind::Histogram => KIND_HISTOGRAM,
            WaveKind::Equalisation => KIND_EQUALISATION,
        }
    }

    fn name(self) -> &'static str {
        match self {
            WaveKind::Histogram => "histogram",
            WaveKind::Equalisation => "equalisation",
        }
    }
}

pub struct Server {
    work: Router,
    control: Router,
    dispatcher: Dispatcher,
    heartbeat_interval: Duration,
    ordering: FileOrdering,
    output_dir: PathBuf,
    log: Option<RunLog>,
}

impl Server {
    /// Bind both channels. This is the only startup-fatal operation.
    pub fn bind(options: ServerOptions) -> Result<Self, ServeError> {
        let work = Router::bind(&options.bind_host, options.work_port).map_err(ServeError::Bind)?;
        let control =
            Router::bind(&options.bind_host, options.comm_port).map_err(ServeError::Bind)?;

        let mut log = match &options.log_path {
            Some(path) => match RunLog::open(path) {
                Ok(log) => Some(log),
                Err(e) => {
                    eprintln!("lq-server: cannot open run log: {e}");
                    None
                }
            },
            None => None,
        };
        if let Some(log) = log.as_mut() {
            log.emit(&ServerListeningV1 {
                event: "server_listening_v1",
                ts_ms: now_ms(),
                work_port: work.port(),
                comm_port: control.port(),
            });
        }

        Ok(Self {
            work,
            control,
            dispatcher: Dispatcher::new(options.max_worker_queue, options.heartbeat_interval),
            heartbeat_interval: options.heartbeat_interval,
            ordering: options.ordering,
            output_dir: options.output_dir,
            log,
        })
    }

    pub fn work_port(&self) -> u16 {
        self.work.port()
    }

    pub fn comm_port(&self) -> u16 {
        self.control.port()
    }

    /// Run the full two-wave pipeline over the regular files in `dir`.
    pub fn serve(&mut self, dir: &Path) -> Result<ServeSummary, ServeError> {
        let filenames = enumerate_regular_files(dir)?;
        let image_count = filenames.len();
        if image_count == 0 {
            return Ok(ServeSummary {
                images: 0,
                outputs: Vec::new(),
            });
        }

        // Wave 1: one histogram job per file.
        self.emit_wave_started(WaveKind::Histogram, image_count);
        self.dispatcher.enqueue(
            filenames
                .iter()
                .map(|filename| Job::Histogram {
                    filename: filename.clone(),
                }),
        );
        self.prime_dispatch();

        let mut histograms: HashMap<String, Histogram> = HashMap::new();
        self.run_wave(image_count, WaveKind::Histogram, &mut |result| {
            match result {
                JobResult::Histogram {
                    filename,
                    histogram,
                } => histograms.insert(filename, histogram).is_none(),
                JobResult::Equalisation { .. } => false,
            }
        });
        self.emit_wave_finished(WaveKind::Histogram, histograms.len());

        // Wave 2: neighbour matching in comparator order; the first image
        // has no predecessor and keeps its own distribution.
        let jobs = build_equalisation_jobs(histograms, &self.ordering)?;
        self.emit_wave_started(WaveKind::Equalisation, jobs.len());
        self.dispatcher.enqueue(jobs);
        self.prime_dispatch();

        let mut outputs = Vec::with_capacity(image_count);
        let mut written: HashSet<String> = HashSet::new();
        let output_dir = self.output_dir.clone();
        self.run_wave(image_count, WaveKind::Equalisation, &mut |result| {
            match result {
                JobResult::Equalisation {
                    filename,
                    tiff_data,
                } => {
                    if written.contains(&filename) {
                        return false;
                    }
                    let path = output_path(&output_dir, &filename);
                    match fs::write(&path, &tiff_data) {
                        Ok(()) => {
                            written.insert(filename);
                            outputs.push(path);
                            true
                        }
                        Err(e) => {
                            eprintln!("lq-server: cannot write {}: {e}", path.display());
                            // Count it complete anyway; redoing the job
                            // would hit the same filesystem problem.
                            written.insert(filename);
                            true
                        }
                    }
                }
                JobResult::Histogram { .. } => false,
            }
        });
        self.emit_wave_finished(WaveKind::Equalisation, written.len());

        self.dismiss_all();

        Ok(ServeSummary {
            images: image_count,
            outputs,
        })
    }

    /// One receive loop. `accept` stores a result of the right kind and
    /// reports whether it made new progress; the loop exits once `expected`
    /// distinct results are in.
    fn run_wave(
        &mut self,
        expected: usize,
        wave: WaveKind,
        accept: &mut dyn FnMut(JobResult) -> bool,
    ) {
        let mut completed = 0usize;
        while completed < expected {
            match self.work.recv_timeout(self.heartbeat_interval) {
                Ok(RouterEvent::Message { identity, payload }) => {
                    if self.handle_work_frame(&identity, &payload, wave, accept) {
                        completed += 1;
                    }
                }
                Ok(RouterEvent::Disconnected { identity }) => {
                    // Liveness is heartbeat-driven; a dropped connection is
                    // only noted here and cleaned up by the sweep.
                    eprintln!("lq-server: work connection to {identity} dropped");
                }
                Err(RecvError::Timeout) => {}
                Err(RecvError::Closed) => break,
                Err(RecvError::Net(e)) => {
                    eprintln!("lq-server: work channel receive failed: {e}");
                }
            }
            self.drain_control();
            self.sweep();
        }
    }

    /// Returns true when the frame completed a new unit of wave work.
    fn handle_work_frame(
        &mut self,
        identity: &str,
        payload: &[u8],
        wave: WaveKind,
        accept: &mut dyn FnMut(JobResult) -> bool,
    ) -> bool {
        let command = match decode_command(payload) {
            Ok(command) => command,
            Err(e) => {
                self.emit_frame_dropped("work", format!("undecodable frame: {e}"));
                return false;
            }
        };

        match command {
            Command::Result(result) => self.on_result(identity, result, wave, accept),
            Command::Bye => {
                if let Some(requeued) = self.dispatcher.release_worker(identity) {
                    self.emit_dismissed(identity, requeued, "bye");
                    self.prime_dispatch();
                }
                false
            }
            other => {
                self.emit_frame_dropped(
                    "work",
                    format!("unexpected {} from {identity}", other.tag()),
                );
                false
            }
        }
    }

    fn on_helo(&mut self, identity: &str, concurrency: u32) {
        self.dispatcher
            .register_worker(identity, concurrency, Instant::now());
        if let Err(e) = self.control.send_command(identity, &Command::Ehlo) {
            eprintln!("lq-server: EHLO to {identity} failed: {e}");
        }
        if let Err(e) = self
            .control
            .send_command(identity, &Command::Heartbeat(HeartbeatKind::Request))
        {
            eprintln!("lq-server: heartbeat request to {identity} failed: {e}");
        }
        if let Some(log) = self.log.as_mut() {
            log.emit(&WorkerJoinedV1 {
                event: "worker_joined_v1",
                ts_ms: now_ms(),
                identity: identity.to_string(),
                concurrency,
            });
        }
        self.dispatch_to(identity);
    }

    fn on_result(
        &mut self,
        identity: &str,
        result: JobResult,
        wave: WaveKind,
        accept: &mut dyn FnMut(JobResult) -> bool,
    ) -> bool {
        if result.kind() != wave.expected_kind() {
            self.emit_frame_dropped(
                "work",
                format!(
                    "{} result for {:?} outside its wave",
                    result.kind(),
                    result.filename()
                ),
            );
            return false;
        }

        match self.dispatcher.complete(identity, &result) {
            CompleteOutcome::UnknownWorker => {
                self.emit_frame_dropped(
                    "work",
                    format!("invalid result from unregistered worker {identity}"),
                );
                false
            }
            CompleteOutcome::NoMatchingJob => {
                self.emit_frame_dropped(
                    "work",
                    format!(
                        "result for {:?} matches nothing in {identity}'s backlog",
                        result.filename()
                    ),
                );
                false
            }
            CompleteOutcome::Accepted => {
                if let Some(log) = self.log.as_mut() {
                    log.emit(&ResultAcceptedV1 {
                        event: "result_accepted_v1",
                        ts_ms: now_ms(),
                        identity: identity.to_string(),
                        kind: wave.expected_kind(),
                        filename: result.filename().to_string(),
                    });
                }
                let progressed = accept(result);
                self.dispatch_to(identity);
                progressed
            }
        }
    }

    fn drain_control(&mut self) {
        while let Some(event) = self.control.try_recv() {
            match event {
                RouterEvent::Message { identity, payload } => match decode_command(&payload) {
                    Ok(Command::Helo { concurrency }) => {
                        self.on_helo(&identity, concurrency);
                    }
                    Ok(Command::Heartbeat(HeartbeatKind::Reply)) => {
                        self.dispatcher.heartbeat_reply(&identity);
                    }
                    Ok(Command::Bye) => {
                        if let Some(requeued) = self.dispatcher.release_worker(&identity) {
                            self.emit_dismissed(&identity, requeued, "bye");
                            self.prime_dispatch();
                        }
                    }
                    Ok(other) => {
                        self.emit_frame_dropped(
                            "control",
                            format!("unexpected {} from {identity}", other.tag()),
                        );
                    }
                    Err(e) => {
                        self.emit_frame_dropped("control", format!("undecodable frame: {e}"));
                    }
                },
                RouterEvent::Disconnected { .. } => {}
            }
        }
    }

    fn sweep(&mut self) {
        let outcome = self.dispatcher.sweep(Instant::now());
        for (identity, requeued) in &outcome.dismissed {
            if let Err(e) = self.work.send_command(identity, &Command::Bye) {
                eprintln!("lq-server: BYE to {identity} failed: {e}");
            }
            self.work.disconnect_peer(identity);
            self.control.disconnect_peer(identity);
            self.emit_dismissed(identity, *requeued, "heartbeat-timeout");
        }
        for identity in &outcome.heartbeat_due {
            if let Err(e) = self
                .control
                .send_command(identity, &Command::Heartbeat(HeartbeatKind::Request))
            {
                eprintln!("lq-server: heartbeat request to {identity} failed: {e}");
            }
        }
        if self.dispatcher.pending_jobs() > 0 {
            // Pending jobs must reach workers with spare capacity even when
            // no result is in flight to trigger dispatch: after a dismissal
            // re-queues a backlog, and after a send raced a work connection
            // still in the accept queue and was rolled back.
            self.prime_dispatch();
        }
    }

    fn dispatch_to(&mut self, identity: &str) {
        let sent = self.dispatcher.dispatch(identity, &self.work);
        self.emit_dispatched(identity, &sent);
    }

    fn prime_dispatch(&mut self) {
        for identity in self.dispatcher.identities() {
            self.dispatch_to(&identity);
        }
    }

    fn dismiss_all(&mut self) {
        for identity in self.dispatcher.identities() {
            if let Err(e) = self.work.send_command(&identity, &Command::Bye) {
                eprintln!("lq-server: BYE to {identity} failed: {e}");
            }
            if let Some(requeued) = self.dispatcher.release_worker(&identity) {
                self.emit_dismissed(&identity, requeued, "run-complete");
            }
        }
    }

    fn emit_dispatched(&mut self, identity: &str, sent: &[(&'static str, String)]) {
        if let Some(log) = self.log.as_mut() {
            for (kind, filename) in sent {
                log.emit(&lq_logging::JobDispatchedV1 {
                    event: "job_dispatched_v1",
                    ts_ms: now_ms(),
                    identity: identity.to_string(),
                    kind: *kind,
                    filename: filename.clone(),
                });
            }
        }
    }

    fn emit_dismissed(&mut self, identity: &str, requeued: usize, reason: &'static str) {
        if let Some(log) = self.log.as_mut() {
            log.emit(&WorkerDismissedV1 {
                event: "worker_dismissed_v1",
                ts_ms: now_ms(),
                identity: identity.to_string(),
                requeued_jobs: requeued,
                reason,
            });
        }
    }

    fn emit_frame_dropped(&mut self, context: &'static str, detail: String) {
        eprintln!("lq-server: [{context}] {detail}");
        if let Some(log) = self.log.as_mut() {
            log.emit(&FrameDroppedV1 {
                event: "frame_dropped_v1",
                ts_ms: now_ms(),
                context,
                detail,
            });
        }
    }

    fn emit_wave_started(&mut self, wave: WaveKind, jobs: usize) {
        if let Some(log) = self.log.as_mut() {
            log.emit(&WaveStartedV1 {
                event: "wave_started_v1",
                ts_ms: now_ms(),
                wave: wave.name(),
                jobs,
            });
        }
    }

    fn emit_wave_finished(&mut self, wave: WaveKind, results: usize) {
        if let Some(log) = self.log.as_mut() {
            log.emit(&WaveFinishedV1 {
                event: "wave_finished_v1",
                ts_ms: now_ms(),
                wave: wave.name(),
                results,
            });
        }
    }
}

fn enumerate_regular_files(dir: &Path) -> Result<Vec<String>, std::io::Error> {
    let mut filenames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            filenames.push(entry.path().to_string_lossy().into_owned());
        }
    }
    Ok(filenames)
}

/// Pair neighbouring histograms into equalisation jobs.
fn build_equalisation_jobs(
    histograms: HashMap<String, Histogram>,
    ordering: &FileOrdering,
) -> Result<Vec<Job>, MatchError> {
    let mut ordered: Vec<(String, Histogram)> = histograms.into_iter().collect();
    ordered.sort_by(|(a, _), (b, _)| ordering.compare(a, b));

    let mut jobs = Vec::with_capacity(ordered.len());
    let mut previous: Option<&Histogram> = None;
    for (filename, histogram) in &ordered {
        let mapping = match previous {
            None => identity_mapping(),
            Some(previous) => equalisation_mapping(previous, histogram)?,
        };
        jobs.push(Job::Equalisation {
            filename: filename.clone(),
            mapping,
        });
        previous = Some(histogram);
    }
    Ok(jobs)
}

/// `<basename>.tiff` in the output directory.
fn output_path(output_dir: &Path, filename: &str) -> PathBuf {
    let basename = Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    output_dir.join(format!("{basename}.tiff"))
}
