//! The worker entry point: a set of known servers fed by discovery, drained
//! one connection at a time.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use lq_core::MAX_HEARTBEAT_INTERVAL;

use crate::connection::{ServerConnection, ServerDetails};

/// Delay before re-queueing a server whose connect attempt failed, so a
/// vanished server does not spin the reconnect loop hot.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct Worker {
    servers: Mutex<VecDeque<ServerDetails>>,
    available: Condvar,
    recv_timeout: Duration,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Self {
        Self::with_timeout(MAX_HEARTBEAT_INTERVAL)
    }

    /// Timeout-parameterised constructor for tests.
    pub fn with_timeout(recv_timeout: Duration) -> Self {
        Self {
            servers: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            recv_timeout,
        }
    }

    /// Discovery callback: a resolved server instance became available.
    pub fn add_server(&self, name: &str, address: &str, work_port: u16, comm_port: u16) {
        let details = ServerDetails::new(name, address, work_port, comm_port);
        let mut servers = self.servers.lock().unwrap();
        if !servers.contains(&details) {
            servers.push_back(details);
            self.available.notify_one();
        }
    }

    /// Discovery callback: a server instance went away.
    pub fn remove_server(&self, name: &str, address: &str, work_port: u16, comm_port: u16) {
        let details = ServerDetails::new(name, address, work_port, comm_port);
        self.servers
            .lock()
            .unwrap()
            .retain(|known| known != &details);
    }

    pub fn known_servers(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    fn pop_details(&self) -> ServerDetails {
        let mut servers = self.servers.lock().unwrap();
        loop {
            if let Some(details) = servers.pop_front() {
                return details;
            }
            servers = self.available.wait(servers).unwrap();
        }
    }

    /// Serve jobs until dismissal. With `persist` the worker re-queues each
    /// server after its run ends and keeps looping; without it, one
    /// connection lifetime is the whole worker lifetime.
    pub fn run_jobs(&self, persist: bool) {
        loop {
            let details = self.pop_details();
            let mut connection =
                ServerConnection::with_timeout(details.clone(), self.recv_timeout);

            match connection.connect() {
                Ok(()) => {
                    if let Err(e) = connection.run() {
                        eprintln!("lq-worker: connection to {} ended: {e}", details.name);
                    }
                }
                Err(e) => {
                    eprintln!("lq-worker: cannot connect to {}: {e}", details.name);
                    if persist {
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }

            if !persist {
                break;
            }
            self.add_server(
                &details.name,
                &details.address,
                details.work_port,
                details.comm_port,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_servers_collapse() {
        let worker = Worker::new();
        worker.add_server("srv", "::1", 42069, 42070);
        worker.add_server("srv", "::1", 42069, 42070);
        assert_eq!(worker.known_servers(), 1);
    }

    #[test]
    fn removed_servers_are_forgotten() {
        let worker = Worker::new();
        worker.add_server("a", "::1", 42069, 42070);
        worker.add_server("b", "::1", 42169, 42170);
        worker.remove_server("a", "::1", 42069, 42070);
        assert_eq!(worker.known_servers(), 1);
    }
}
