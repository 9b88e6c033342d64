//! lq-logging: append-only NDJSON events for run post-mortems.
//!
//! The server (and optionally a worker) appends one JSON object per line
//! describing cluster lifecycle: workers joining and being dismissed, jobs
//! moving, waves starting and finishing, frames dropped. Event logging must
//! never take a run down, so [`RunLog`] swallows write errors.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerListeningV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub work_port: u16,
    pub comm_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerJoinedV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub identity: String,
    pub concurrency: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerDismissedV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub identity: String,
    pub requeued_jobs: usize,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDispatchedV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub identity: String,
    pub kind: &'static str,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultAcceptedV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub identity: String,
    pub kind: &'static str,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameDroppedV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub context: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaveStartedV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub wave: &'static str,
    pub jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaveFinishedV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub wave: &'static str,
    pub results: usize,
}

#[derive(Debug)]
pub enum NdjsonError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl From<io::Error> for NdjsonError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for NdjsonError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl std::fmt::Display for NdjsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for NdjsonError {}

/// Append-only NDJSON writer.
///
/// Contract: each call writes exactly one JSON object followed by a newline.
pub struct NdjsonWriter {
    w: BufWriter<File>,
}

impl NdjsonWriter {
    /// Open a file for append. Creates it if it doesn't exist.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            w: BufWriter::new(f),
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), NdjsonError> {
        let mut buf = serde_json::to_vec(event)?;
        buf.push(b'\n');
        self.w.write_all(&buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NdjsonError> {
        self.w.flush()?;
        Ok(())
    }
}

/// Best-effort event sink: write errors are dropped so logging can never
/// take down a wave.
pub struct RunLog {
    writer: NdjsonWriter,
}

impl RunLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        Ok(Self {
            writer: NdjsonWriter::open_append(path)?,
        })
    }

    pub fn emit<T: Serialize>(&mut self, event: &T) {
        let _ = self.writer.write_event(event);
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use serde_json::Value;

    fn read_ndjson(path: &Path) -> Vec<Value> {
        let s = fs::read_to_string(path).expect("read");
        s.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<Value>(line).expect("line is json"))
            .collect()
    }

    #[test]
    fn writes_one_valid_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut w = NdjsonWriter::open_append(&path).unwrap();

        w.write_event(&WorkerJoinedV1 {
            event: "worker_joined_v1",
            ts_ms: 1,
            identity: "AAAAA".into(),
            concurrency: 8,
        })
        .unwrap();
        w.write_event(&WaveStartedV1 {
            event: "wave_started_v1",
            ts_ms: 2,
            wave: "histogram",
            jobs: 40,
        })
        .unwrap();
        w.flush().unwrap();

        let vals = read_ndjson(&path);
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0]["event"], "worker_joined_v1");
        assert_eq!(vals[0]["identity"], "AAAAA");
        assert_eq!(vals[1]["jobs"], 40);
    }

    #[test]
    fn run_log_appends_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ndjson");

        {
            let mut log = RunLog::open(&path).unwrap();
            log.emit(&FrameDroppedV1 {
                event: "frame_dropped_v1",
                ts_ms: now_ms(),
                context: "wave-1",
                detail: "bad tag".into(),
            });
        }
        {
            let mut log = RunLog::open(&path).unwrap();
            log.emit(&FrameDroppedV1 {
                event: "frame_dropped_v1",
                ts_ms: now_ms(),
                context: "wave-2",
                detail: "bad tag".into(),
            });
        }

        let vals = read_ndjson(&path);
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0]["context"], "wave-1");
        assert_eq!(vals[1]["context"], "wave-2");
    }
}
