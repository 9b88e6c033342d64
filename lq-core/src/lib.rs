//! lq-core: lightness-histogram model, equalisation matching, and the
//! constants shared across the lumeq cluster.

pub mod config;
pub mod histogram;
pub mod matching;

pub use config::{
    COMMUNICATION_PORT, HISTOGRAM_SEGMENTS, LIBRARY_PARALLELISM, MAX_CHUNK_COUNT, MAX_CHUNK_SIZE,
    MAX_HEARTBEAT_INTERVAL, MAX_MESSAGE_SIZE, MAX_WORKER_QUEUE, WORKER_ID_LEN, WORK_PORT,
};
pub use histogram::{bin_index, lightness_histogram, Histogram, HistogramError};
pub use matching::{equalisation_mapping, identity_mapping, HistogramMapping, MatchError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
