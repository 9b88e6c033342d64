//! Socket identities.
//!
//! A worker picks one random identity at connect time and sets it on both
//! of its sockets; the server routes by it. The alphabet is alphanumeric so
//! identities stay printable in logs, keeping the 5-symbol wire width.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use lq_core::WORKER_ID_LEN;

/// Generate a fresh random identity.
pub fn random_identity() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(WORKER_ID_LEN)
        .map(char::from)
        .collect()
}

/// Validate the raw bytes of an identity handshake frame.
pub fn identity_from_frame(frame: &[u8]) -> Option<String> {
    if frame.len() != WORKER_ID_LEN {
        return None;
    }
    String::from_utf8(frame.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_have_the_wire_width() {
        for _ in 0..64 {
            let id = random_identity();
            assert_eq!(id.len(), WORKER_ID_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn frame_validation_checks_width() {
        assert!(identity_from_frame(b"abcde").is_some());
        assert!(identity_from_frame(b"abcd").is_none());
        assert!(identity_from_frame(b"abcdef").is_none());
        assert!(identity_from_frame(&[0xFF; 5]).is_none());
    }
}
