//! Command taxonomy for the coordination protocol.
//!
//! Every message on either channel is one command. The work channel carries
//! HELO/EHLO/JOB/RESULT/BYE; the control channel carries HEARTBEAT (and BYE
//! on dismissal). Each receiving context matches on the kinds it expects
//! and logs-and-drops the rest.

use lq_core::histogram::Histogram;
use lq_core::matching::HistogramMapping;

/// Codec version stamped on every encoded command.
pub const CODEC_VERSION: u32 = 1;

/// Top-level command tags as they appear on the wire.
pub const TAG_HELO: &str = "HELO";
pub const TAG_EHLO: &str = "EHLO";
pub const TAG_JOB: &str = "JOB";
pub const TAG_RESULT: &str = "RESULT";
/// The one canonical spelling; no other form is accepted.
pub const TAG_HEARTBEAT: &str = "HEARTBEAT";
pub const TAG_BYE: &str = "BYE";

/// Inner kind tags shared by jobs and results.
pub const KIND_HISTOGRAM: &str = "HISTOGRAM";
pub const KIND_EQUALISATION: &str = "EQUALISATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatKind {
    Request = 1,
    Reply = 2,
}

/// A unit of work sent to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Histogram {
        filename: String,
    },
    Equalisation {
        filename: String,
        mapping: HistogramMapping,
    },
}

impl Job {
    pub fn filename(&self) -> &str {
        match self {
            Job::Histogram { filename } | Job::Equalisation { filename, .. } => filename,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Histogram { .. } => KIND_HISTOGRAM,
            Job::Equalisation { .. } => KIND_EQUALISATION,
        }
    }
}

/// A completed unit of work returned by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Histogram {
        filename: String,
        histogram: Histogram,
    },
    Equalisation {
        filename: String,
        tiff_data: Vec<u8>,
    },
}

impl JobResult {
    pub fn filename(&self) -> &str {
        match self {
            JobResult::Histogram { filename, .. } | JobResult::Equalisation { filename, .. } => {
                filename
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobResult::Histogram { .. } => KIND_HISTOGRAM,
            JobResult::Equalisation { .. } => KIND_EQUALISATION,
        }
    }

    /// Whether this result answers the given job. Identity for matching is
    /// `(kind, filename)` on both sides.
    pub fn matches_job(&self, job: &Job) -> bool {
        self.kind() == job.kind() && self.filename() == job.filename()
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Worker announces itself with a concurrency hint.
    Helo { concurrency: u32 },
    /// Server accepts a worker.
    Ehlo,
    Job(Job),
    Result(JobResult),
    Heartbeat(HeartbeatKind),
    /// Either side ends the relationship.
    Bye,
}

impl Command {
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Helo { .. } => TAG_HELO,
            Command::Ehlo => TAG_EHLO,
            Command::Job(_) => TAG_JOB,
            Command::Result(_) => TAG_RESULT,
            Command::Heartbeat(_) => TAG_HEARTBEAT,
            Command::Bye => TAG_BYE,
        }
    }
}
