//! Cluster-wide constants.
//!
//! These are the defaults baked into the wire protocol and the dispatch
//! engine; the runtime option structs in `lq-server`/`lq-worker` default to
//! them and let tests shrink timeouts or bind ephemeral ports.

use std::time::Duration;

/// Number of bins in a lightness histogram (and in a bin mapping).
pub const HISTOGRAM_SEGMENTS: usize = 1 << 10;

/// Cap on jobs in flight to a single worker.
pub const MAX_WORKER_QUEUE: usize = 32;

/// Largest single chunk of a bulk payload on the wire.
///
/// Increasing this reduces overhead at a potential cost of compatibility;
/// it should not exceed 512 MiB.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Cap on the number of chunks in one bulk payload.
pub const MAX_CHUNK_COUNT: u32 = 256;

/// Largest total message the codec will produce or accept.
pub const MAX_MESSAGE_SIZE: u64 = MAX_CHUNK_COUNT as u64 * MAX_CHUNK_SIZE;

/// Max interval between a heartbeat request and its reply before a peer is
/// considered dead. Also the receive timeout on the work channel.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Length in symbols of a worker's socket identity. With 62^5 names the
/// chance of a birthday collision stays below 0.1% for ~10^9 nodes.
pub const WORKER_ID_LEN: usize = 5;

/// TCP port for the work channel (JOB/RESULT/HELO/EHLO/BYE).
pub const WORK_PORT: u16 = 42069;

/// TCP port for the control channel (HEARTBEAT).
pub const COMMUNICATION_PORT: u16 = WORK_PORT + 1;

/// Whether the image collaborator parallelises internally. When true the
/// worker pool is forced down to a single thread to avoid oversubscription.
pub const LIBRARY_PARALLELISM: bool = false;
