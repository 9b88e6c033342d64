//! lq-proto: the on-wire contract of the lumeq cluster.
//!
//! Commands are single structured records carried one-per-frame by the
//! `lq-net` transport; see `command` for the taxonomy and `codec` for the
//! byte layout.

pub mod codec;
pub mod command;

pub use codec::{decode_command, encode_command, DecodeError, EncodeError};
pub use command::{
    Command, HeartbeatKind, Job, JobResult, CODEC_VERSION, KIND_EQUALISATION, KIND_HISTOGRAM,
    TAG_BYE, TAG_EHLO, TAG_HEARTBEAT, TAG_HELO, TAG_JOB, TAG_RESULT,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
