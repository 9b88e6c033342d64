//! lq-worker: the compute-node runtime.
//!
//! A worker browses for servers (via whatever discovery feeds
//! [`Worker::add_server`]), connects with a shared random identity on the
//! work and control channels, runs received jobs on a thread pool, and
//! shuts down when dismissed.

pub mod connection;
pub mod execute;
pub mod worker;

pub use connection::{
    next_state, worker_thread_count, ConnectionState, ServerConnection, ServerDetails, WorkerError,
};
pub use execute::execute_job;
pub use worker::Worker;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
