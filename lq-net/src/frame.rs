//! Length-delimited framing (u64 little-endian length prefix).
//!
//! One frame carries one codec payload (or an identity). The length cap
//! leaves headroom over the codec's message cap for the chunk headers.

use std::io::{Read, Write};

use thiserror::Error;

use lq_core::MAX_MESSAGE_SIZE;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {len} > {max}")]
    TooLarge { len: u64, max: u64 },
    #[error("unexpected EOF while reading frame")]
    UnexpectedEof,
}

/// Guardrail on a single frame: the codec's message cap plus header slack.
pub const MAX_FRAME_LEN: u64 = MAX_MESSAGE_SIZE + (1 << 20);

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read a whole frame, retrying through read timeouts. Use this once a
/// message is known to be in flight (e.g. for the second frame of a pair).
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_bytes = [0u8; 8];
    read_exact_retrying(r, &mut len_bytes)?;
    read_body(r, len_bytes)
}

/// Read a frame, but yield `None` if the read times out before the first
/// byte of the length prefix arrives. A timeout mid-frame keeps retrying so
/// the stream never desynchronises.
pub fn read_frame_start<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_bytes = [0u8; 8];
    let mut off = 0usize;
    while off < len_bytes.len() {
        match r.read(&mut len_bytes[off..]) {
            Ok(0) => return Err(FrameError::UnexpectedEof),
            Ok(n) => off += n,
            Err(e) if is_timeout(&e) => {
                if off == 0 {
                    return Ok(None);
                }
                // Partial length prefix: the frame is in flight, keep going.
            }
            Err(e) => return Err(e.into()),
        }
    }
    read_body(r, len_bytes).map(Some)
}

fn read_body<R: Read>(r: &mut R, len_bytes: [u8; 8]) -> Result<Vec<u8>, FrameError> {
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len as usize];
    read_exact_retrying(r, &mut payload)?;
    Ok(payload)
}

fn read_exact_retrying<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut off = 0usize;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => return Err(FrameError::UnexpectedEof),
            Ok(n) => off += n,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_over_a_buffer() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        write_frame(&mut wire, b"").unwrap();
        write_frame(&mut wire, &[7u8; 300]).unwrap();

        let mut r = wire.as_slice();
        assert_eq!(read_frame(&mut r).unwrap(), b"hello");
        assert_eq!(read_frame(&mut r).unwrap(), b"");
        assert_eq!(read_frame(&mut r).unwrap(), vec![7u8; 300]);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut r = wire.as_slice();
        assert!(matches!(
            read_frame(&mut r),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn truncated_stream_is_eof() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        wire.truncate(wire.len() - 2);
        let mut r = wire.as_slice();
        assert!(matches!(
            read_frame(&mut r),
            Err(FrameError::UnexpectedEof)
        ));
    }
}
