//! lq-server: the coordinator side of the lumeq cluster.
//!
//! [`Server`] binds the work and control routers, then [`Server::serve`]
//! runs the two-wave pipeline over an input directory: histogram collection
//! first, then per-image equalisation against each image's predecessor in
//! sorted order. The [`dispatch`] module holds the queue/backlog core the
//! receive loops drive.

pub mod dispatch;
pub mod engine;
#[cfg(test)]
mod dispatch_tests;

pub use dispatch::{CommandSink, CompleteOutcome, Dispatcher, SweepOutcome, WorkerEntry};
pub use engine::{FileOrdering, ServeError, ServeSummary, Server, ServerOptions};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
