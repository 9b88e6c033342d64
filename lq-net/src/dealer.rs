//! Dealer socket: the worker end of a channel.
//!
//! Connects to a router, sends its identity as a handshake frame, then
//! exchanges payload frames. Messages from the router arrive as an identity
//! frame followed by the payload frame; messages to the router are a single
//! payload frame (the router tags them with this connection's identity).

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use crate::frame::{read_frame, read_frame_start, write_frame, FrameError};
use crate::{NetError, RecvError};

pub struct Dealer {
    identity: String,
    reader: TcpStream,
    writer: Mutex<TcpStream>,
}

impl Dealer {
    /// Connect and perform the identity handshake. `recv_timeout` bounds
    /// every blocking receive so loops can observe shutdown.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        identity: &str,
        recv_timeout: Duration,
    ) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(recv_timeout))?;

        let mut writer = stream.try_clone()?;
        write_frame(&mut writer, identity.as_bytes())?;

        Ok(Self {
            identity: identity.to_string(),
            reader: stream,
            writer: Mutex::new(writer),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Send one payload frame. Safe to call from several threads.
    pub fn send(&self, payload: &[u8]) -> Result<(), NetError> {
        let mut writer = self.writer.lock().unwrap();
        write_frame(&mut *writer, payload)?;
        Ok(())
    }

    /// Receive one message (identity frame, then payload frame). A clean
    /// timeout before anything arrives is `RecvError::Timeout`; once the
    /// identity frame lands the payload read retries through timeouts.
    pub fn recv(&self) -> Result<Vec<u8>, RecvError> {
        let mut reader = &self.reader;
        let _identity = match read_frame_start(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(RecvError::Timeout),
            Err(FrameError::UnexpectedEof) => return Err(RecvError::Closed),
            Err(e) => return Err(RecvError::Net(e.into())),
        };
        match read_frame(&mut reader) {
            Ok(payload) => Ok(payload),
            Err(FrameError::UnexpectedEof) => Err(RecvError::Closed),
            Err(e) => Err(RecvError::Net(e.into())),
        }
    }

    /// Shut the connection down; pending and future receives fail.
    pub fn close(&self) {
        let _ = self.reader.shutdown(Shutdown::Both);
    }
}

impl Drop for Dealer {
    fn drop(&mut self) {
        self.close();
    }
}
