//! lq-net: message-oriented sockets with router/dealer semantics.
//!
//! The transport contract the rest of the cluster assumes: message
//! boundaries are preserved, payloads arrive bytewise identical, and the
//! server addresses workers by the identity each dealer sets at connect
//! time.

pub mod dealer;
pub mod frame;
pub mod identity;
pub mod router;

use thiserror::Error;

pub use dealer::Dealer;
pub use frame::{read_frame, read_frame_start, write_frame, FrameError, MAX_FRAME_LEN};
pub use identity::{identity_from_frame, random_identity};
pub use router::{Router, RouterEvent};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("no connected peer with identity {0:?}")]
    UnknownPeer(String),
    #[error("peer sent a malformed identity handshake")]
    BadIdentity,
}

#[derive(Debug, Error)]
pub enum RecvError {
    /// Nothing arrived within the receive timeout. Not an error condition;
    /// callers loop back to their liveness sweep.
    #[error("receive timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
