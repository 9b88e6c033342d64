//! One worker's relationship with one server: the connection state
//! machine, the two receive loops, and the job pool.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use lq_core::{LIBRARY_PARALLELISM, MAX_HEARTBEAT_INTERVAL};
use lq_net::{random_identity, Dealer, NetError, RecvError};
use lq_proto::{decode_command, encode_command, Command, HeartbeatKind, Job};

use crate::execute::execute_job;

/// A server as resolved by discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerDetails {
    pub name: String,
    pub address: String,
    pub work_port: u16,
    pub comm_port: u16,
}

impl ServerDetails {
    pub fn new(name: &str, address: &str, work_port: u16, comm_port: u16) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            work_port,
            comm_port,
        }
    }

    fn endpoint(&self, port: u16) -> String {
        // Bracket bare IPv6 addresses (including `addr%iface` scoped ones).
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, port)
        } else {
            format!("{}:{}", self.address, port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Dying,
}

/// Forward-only transition function; attempts to regress are no-ops.
pub fn next_state(current: ConnectionState, requested: ConnectionState) -> ConnectionState {
    match current {
        ConnectionState::Unconnected => requested,
        ConnectionState::Connected => {
            if requested == ConnectionState::Unconnected {
                current
            } else {
                requested
            }
        }
        ConnectionState::Dying => current,
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Net(#[from] NetError),
    #[error("receive failed: {0}")]
    Recv(#[from] RecvError),
    #[error("server dismissed the connection before accepting it")]
    Dismissed,
    #[error("server did not accept the connection in time")]
    ConnectTimeout,
    #[error("connection is not in the {expected:?} state")]
    BadState { expected: ConnectionState },
}

/// How many pool threads a worker runs, which is also the concurrency hint
/// announced in HELO.
pub fn worker_thread_count() -> u32 {
    if LIBRARY_PARALLELISM {
        1
    } else {
        thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }
}

/// LIFO buffer of jobs awaiting a pool thread, with shutdown-aware wakeups.
struct JobBuffer {
    jobs: Mutex<Vec<Job>>,
    available: Condvar,
}

impl JobBuffer {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, job: Job) {
        self.jobs.lock().unwrap().push(job);
        self.available.notify_one();
    }

    /// Pop the most recent job, blocking while the buffer is empty. Returns
    /// `None` once the buffer is drained and the connection is dying.
    fn pop_or_wait(&self, state: &Mutex<ConnectionState>) -> Option<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            if let Some(job) = jobs.pop() {
                return Some(job);
            }
            if *state.lock().unwrap() == ConnectionState::Dying {
                return None;
            }
            jobs = self.available.wait(jobs).unwrap();
        }
    }

    fn wake_all(&self) {
        // Taking the buffer lock serialises with a pool thread sitting
        // between its shutdown check and the wait, so the broadcast cannot
        // be lost.
        let _guard = self.jobs.lock().unwrap();
        self.available.notify_all();
    }
}

pub struct ServerConnection {
    details: ServerDetails,
    recv_timeout: Duration,
    thread_count: u32,
    state: Arc<Mutex<ConnectionState>>,
    buffer: Arc<JobBuffer>,
    work: Option<Arc<Dealer>>,
    control: Option<Arc<Dealer>>,
}

impl ServerConnection {
    pub fn new(details: ServerDetails) -> Self {
        Self::with_timeout(details, MAX_HEARTBEAT_INTERVAL)
    }

    /// Timeout-parameterised constructor for tests.
    pub fn with_timeout(details: ServerDetails, recv_timeout: Duration) -> Self {
        Self {
            details,
            recv_timeout,
            thread_count: worker_thread_count(),
            state: Arc::new(Mutex::new(ConnectionState::Unconnected)),
            buffer: Arc::new(JobBuffer::new()),
            work: None,
            control: None,
        }
    }

    pub fn details(&self) -> &ServerDetails {
        &self.details
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn transition(&self, requested: ConnectionState) -> ConnectionState {
        transition_shared(&self.state, requested)
    }

    /// Open both channels, announce with HELO, and wait for EHLO.
    ///
    /// The whole handshake runs on the control channel; the work channel
    /// only carries jobs and results. It is connected first so the server
    /// has seen the work-side identity by the time the acceptance triggers
    /// job dispatch.
    pub fn connect(&mut self) -> Result<(), WorkerError> {
        if self.state() != ConnectionState::Unconnected {
            return Err(WorkerError::BadState {
                expected: ConnectionState::Unconnected,
            });
        }

        let identity = random_identity();
        let work = Arc::new(Dealer::connect(
            self.details.endpoint(self.details.work_port),
            &identity,
            self.recv_timeout,
        )?);
        let control = Arc::new(Dealer::connect(
            self.details.endpoint(self.details.comm_port),
            &identity,
            self.recv_timeout,
        )?);

        send_command(
            &control,
            &Command::Helo {
                concurrency: self.thread_count,
            },
        );

        let deadline = Instant::now() + self.recv_timeout * 10;
        loop {
            match control.recv() {
                Ok(payload) => match decode_command(&payload) {
                    Ok(Command::Ehlo) => {
                        self.transition(ConnectionState::Connected);
                        break;
                    }
                    Ok(Command::Bye) => {
                        self.transition(ConnectionState::Dying);
                        return Err(WorkerError::Dismissed);
                    }
                    Ok(other) => {
                        eprintln!(
                            "lq-worker: unexpected {} while connecting to {}",
                            other.tag(),
                            self.details.name
                        );
                    }
                    Err(e) => {
                        eprintln!("lq-worker: dropping undecodable frame: {e}");
                    }
                },
                Err(RecvError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Err(WorkerError::ConnectTimeout);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.work = Some(work);
        self.control = Some(control);
        Ok(())
    }

    /// Drive the connection until dismissal: the control receiver and the
    /// job pool run on background threads, the work receiver on the calling
    /// thread.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        if self.state() != ConnectionState::Connected {
            return Err(WorkerError::BadState {
                expected: ConnectionState::Connected,
            });
        }
        let work = Arc::clone(self.work.as_ref().expect("connected implies sockets"));
        let control = Arc::clone(self.control.as_ref().expect("connected implies sockets"));

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.thread_count as usize + 1);

        {
            let state = Arc::clone(&self.state);
            let buffer = Arc::clone(&self.buffer);
            let control = Arc::clone(&control);
            handles.push(spawn_named("lq-worker-control", move || {
                control_loop(&control, &state, &buffer);
            }));
        }

        for i in 0..self.thread_count {
            let state = Arc::clone(&self.state);
            let buffer = Arc::clone(&self.buffer);
            let work = Arc::clone(&work);
            handles.push(spawn_named(&format!("lq-worker-pool-{i}"), move || {
                pool_loop(&work, &state, &buffer);
            }));
        }

        work_loop(&work, &self.state, &self.buffer);

        // The work loop only exits when the state is Dying; wake the other
        // activities and wait for them.
        self.buffer.wake_all();
        control.close();
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Terminate the connection. Safe to call repeatedly and from `Drop`.
    pub fn disconnect(&mut self) {
        self.transition(ConnectionState::Dying);
        self.buffer.wake_all();
        if let Some(work) = self.work.take() {
            work.close();
        }
        if let Some(control) = self.control.take() {
            control.close();
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn transition_shared(
    state: &Mutex<ConnectionState>,
    requested: ConnectionState,
) -> ConnectionState {
    let mut guard = state.lock().unwrap();
    let previous = *guard;
    *guard = next_state(previous, requested);
    previous
}

fn spawn_named(name: &str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("spawning a worker thread")
}

fn send_command(dealer: &Dealer, command: &Command) {
    match encode_command(command) {
        Ok(payload) => {
            if let Err(e) = dealer.send(&payload) {
                eprintln!("lq-worker: send of {} failed: {e}", command.tag());
            }
        }
        Err(e) => eprintln!("lq-worker: cannot encode {}: {e}", command.tag()),
    }
}

fn work_loop(work: &Dealer, state: &Arc<Mutex<ConnectionState>>, buffer: &Arc<JobBuffer>) {
    while *state.lock().unwrap() != ConnectionState::Dying {
        match work.recv() {
            Ok(payload) => match decode_command(&payload) {
                Ok(Command::Job(job)) => buffer.push(job),
                Ok(Command::Bye) => {
                    transition_shared(state, ConnectionState::Dying);
                    buffer.wake_all();
                }
                Ok(other) => {
                    eprintln!("lq-worker: unexpected {} on work channel", other.tag());
                }
                Err(e) => eprintln!("lq-worker: dropping undecodable frame: {e}"),
            },
            Err(RecvError::Timeout) => {}
            Err(_) => {
                transition_shared(state, ConnectionState::Dying);
                buffer.wake_all();
            }
        }
    }
}

fn control_loop(control: &Dealer, state: &Arc<Mutex<ConnectionState>>, buffer: &Arc<JobBuffer>) {
    while *state.lock().unwrap() != ConnectionState::Dying {
        match control.recv() {
            Ok(payload) => match decode_command(&payload) {
                Ok(Command::Heartbeat(HeartbeatKind::Request)) => {
                    send_command(control, &Command::Heartbeat(HeartbeatKind::Reply));
                }
                Ok(Command::Heartbeat(HeartbeatKind::Reply)) => {
                    eprintln!("lq-worker: unexpected heartbeat reply; this node sent no request");
                }
                Ok(Command::Ehlo) => {
                    // A late duplicate acceptance is harmless.
                }
                Ok(Command::Bye) => {
                    transition_shared(state, ConnectionState::Dying);
                    buffer.wake_all();
                }
                Ok(other) => {
                    eprintln!("lq-worker: unexpected {} on control channel", other.tag());
                }
                Err(e) => eprintln!("lq-worker: dropping undecodable frame: {e}"),
            },
            Err(RecvError::Timeout) => {}
            Err(_) => {
                transition_shared(state, ConnectionState::Dying);
                buffer.wake_all();
            }
        }
    }
}

fn pool_loop(work: &Dealer, state: &Arc<Mutex<ConnectionState>>, buffer: &Arc<JobBuffer>) {
    while let Some(job) = buffer.pop_or_wait(state) {
        if let Some(result) = execute_job(&job) {
            send_command(work, &Command::Result(result));
        }
    }
}
