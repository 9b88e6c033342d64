//! Binary codec for protocol commands (payload inside one transport frame).
//!
//! Layout: `u32` codec version, length-prefixed tag string, then a payload
//! specific to the tag. All integers are little-endian. Histograms travel
//! as 1024 × f32, mappings as 1024 × u16, and bulk TIFF bytes as a chunk
//! list so a single result can carry up to `MAX_MESSAGE_SIZE` of pixels.

use thiserror::Error;

use lq_core::histogram::Histogram;
use lq_core::matching::HistogramMapping;
use lq_core::{HISTOGRAM_SEGMENTS, MAX_CHUNK_COUNT, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE};

use crate::command::{
    Command, HeartbeatKind, Job, JobResult, CODEC_VERSION, KIND_EQUALISATION, KIND_HISTOGRAM,
    TAG_BYE, TAG_EHLO, TAG_HEARTBEAT, TAG_HELO, TAG_JOB, TAG_RESULT,
};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("bulk payload of {len} bytes exceeds the {max} byte message cap")]
    PayloadTooLarge { len: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short")]
    TooShort,
    #[error("unsupported codec version: {0}")]
    BadVersion(u32),
    #[error("unknown command tag: {0:?}")]
    BadTag(String),
    #[error("unknown job/result kind: {0:?}")]
    BadKind(String),
    #[error("invalid heartbeat type byte: {0}")]
    BadHeartbeat(u8),
    #[error("tag is not valid UTF-8")]
    BadTagEncoding,
    #[error("filename is not valid UTF-8")]
    BadFilename,
    #[error("mapping entry {value} out of range")]
    MappingOutOfRange { value: u16 },
    #[error("chunk count {0} exceeds the chunk cap")]
    TooManyChunks(u32),
    #[error("chunk of {0} bytes exceeds the chunk size cap")]
    ChunkTooLarge(u64),
    #[error("chunked payload of {0} bytes exceeds the message cap")]
    MessageTooLarge(u64),
}

/// Encode a command into a transport frame payload.
pub fn encode_command(command: &Command) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&CODEC_VERSION.to_le_bytes());
    write_str8(&mut out, command.tag());

    match command {
        Command::Helo { concurrency } => {
            out.extend_from_slice(&concurrency.to_le_bytes());
        }
        Command::Ehlo | Command::Bye => {}
        Command::Job(job) => encode_job(&mut out, job),
        Command::Result(result) => encode_result(&mut out, result)?,
        Command::Heartbeat(kind) => out.push(*kind as u8),
    }

    Ok(out)
}

/// Decode one transport frame payload into a command.
pub fn decode_command(bytes: &[u8]) -> Result<Command, DecodeError> {
    let mut c = Cursor::new(bytes);

    let version = c.read_u32()?;
    if version != CODEC_VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let tag = c.read_str8()?;
    match tag.as_str() {
        TAG_HELO => Ok(Command::Helo {
            concurrency: c.read_u32()?,
        }),
        TAG_EHLO => Ok(Command::Ehlo),
        TAG_JOB => Ok(Command::Job(decode_job(&mut c)?)),
        TAG_RESULT => Ok(Command::Result(decode_result(&mut c)?)),
        TAG_HEARTBEAT => match c.read_u8()? {
            1 => Ok(Command::Heartbeat(HeartbeatKind::Request)),
            2 => Ok(Command::Heartbeat(HeartbeatKind::Reply)),
            other => Err(DecodeError::BadHeartbeat(other)),
        },
        TAG_BYE => Ok(Command::Bye),
        _ => Err(DecodeError::BadTag(tag)),
    }
}

fn encode_job(out: &mut Vec<u8>, job: &Job) {
    write_str8(out, job.kind());
    write_str32(out, job.filename());
    if let Job::Equalisation { mapping, .. } = job {
        for &entry in mapping.iter() {
            out.extend_from_slice(&entry.to_le_bytes());
        }
    }
}

fn decode_job(c: &mut Cursor<'_>) -> Result<Job, DecodeError> {
    let kind = c.read_str8()?;
    let filename = c.read_str32()?;
    match kind.as_str() {
        KIND_HISTOGRAM => Ok(Job::Histogram { filename }),
        KIND_EQUALISATION => {
            let mut mapping: HistogramMapping = [0u16; HISTOGRAM_SEGMENTS];
            for slot in mapping.iter_mut() {
                let value = c.read_u16()?;
                if value as usize >= HISTOGRAM_SEGMENTS {
                    return Err(DecodeError::MappingOutOfRange { value });
                }
                *slot = value;
            }
            Ok(Job::Equalisation { filename, mapping })
        }
        _ => Err(DecodeError::BadKind(kind)),
    }
}

fn encode_result(out: &mut Vec<u8>, result: &JobResult) -> Result<(), EncodeError> {
    write_str8(out, result.kind());
    write_str32(out, result.filename());
    match result {
        JobResult::Histogram { histogram, .. } => {
            out.reserve(HISTOGRAM_SEGMENTS * 4);
            for &bin in histogram.iter() {
                out.extend_from_slice(&bin.to_le_bytes());
            }
        }
        JobResult::Equalisation { tiff_data, .. } => {
            encode_chunked(out, tiff_data)?;
        }
    }
    Ok(())
}

fn decode_result(c: &mut Cursor<'_>) -> Result<JobResult, DecodeError> {
    let kind = c.read_str8()?;
    let filename = c.read_str32()?;
    match kind.as_str() {
        KIND_HISTOGRAM => {
            let mut histogram: Histogram = [0f32; HISTOGRAM_SEGMENTS];
            for bin in histogram.iter_mut() {
                *bin = c.read_f32()?;
            }
            Ok(JobResult::Histogram {
                filename,
                histogram,
            })
        }
        KIND_EQUALISATION => Ok(JobResult::Equalisation {
            filename,
            tiff_data: decode_chunked(c)?,
        }),
        _ => Err(DecodeError::BadKind(kind)),
    }
}

/// Split a bulk payload into chunk lengths, each at most `MAX_CHUNK_SIZE`.
pub(crate) fn chunk_lengths(total: u64) -> Vec<u64> {
    let mut lengths = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let chunk = remaining.min(MAX_CHUNK_SIZE);
        lengths.push(chunk);
        remaining -= chunk;
    }
    lengths
}

fn encode_chunked(out: &mut Vec<u8>, data: &[u8]) -> Result<(), EncodeError> {
    let total = data.len() as u64;
    if total > MAX_MESSAGE_SIZE {
        return Err(EncodeError::PayloadTooLarge {
            len: total,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let lengths = chunk_lengths(total);
    debug_assert!(lengths.len() as u32 <= MAX_CHUNK_COUNT);

    out.reserve(4 + data.len() + lengths.len() * 8);
    out.extend_from_slice(&(lengths.len() as u32).to_le_bytes());
    let mut offset = 0usize;
    for length in lengths {
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&data[offset..offset + length as usize]);
        offset += length as usize;
    }
    Ok(())
}

fn decode_chunked(c: &mut Cursor<'_>) -> Result<Vec<u8>, DecodeError> {
    let count = c.read_u32()?;
    if count > MAX_CHUNK_COUNT {
        return Err(DecodeError::TooManyChunks(count));
    }

    // Walk the chunk headers first so the reassembly buffer is allocated
    // once instead of growing through quadratic copies.
    let mut lengths = Vec::with_capacity(count as usize);
    let mut total = 0u64;
    {
        let mut probe = c.clone();
        for _ in 0..count {
            let length = probe.read_u64()?;
            if length > MAX_CHUNK_SIZE {
                return Err(DecodeError::ChunkTooLarge(length));
            }
            total += length;
            if total > MAX_MESSAGE_SIZE {
                return Err(DecodeError::MessageTooLarge(total));
            }
            probe.skip(length as usize)?;
            lengths.push(length);
        }
    }

    let mut data = Vec::with_capacity(total as usize);
    for length in lengths {
        let _ = c.read_u64()?;
        data.extend_from_slice(c.take(length as usize)?);
    }
    Ok(data)
}

fn write_str8(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize);
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

fn write_str32(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[derive(Clone)]
struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.off + n > self.bytes.len() {
            return Err(DecodeError::TooShort);
        }
        let s = &self.bytes[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_str8(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadTagEncoding)
    }

    fn read_str32(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadFilename)
    }
}
