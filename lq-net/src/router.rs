//! Router socket: the server end of a channel.
//!
//! Accepts dealer connections, reads each one's identity handshake, then
//! multiplexes every peer's payload frames onto one receive channel. Sends
//! are addressed by identity; the first frame written to a peer is always
//! that peer's identity, the payload is frame two.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::frame::{read_frame, write_frame};
use crate::identity::identity_from_frame;
use crate::{NetError, RecvError};

/// Something that happened on one of the router's connections.
#[derive(Debug)]
pub enum RouterEvent {
    /// A payload frame arrived from the peer with this identity.
    Message { identity: String, payload: Vec<u8> },
    /// The peer's connection went away (EOF or transport error).
    Disconnected { identity: String },
}

type PeerMap = Arc<Mutex<HashMap<String, Arc<Mutex<TcpStream>>>>>;

pub struct Router {
    port: u16,
    peers: PeerMap,
    events: Mutex<mpsc::Receiver<RouterEvent>>,
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Router {
    /// Bind and start accepting. Port 0 binds an ephemeral port; the actual
    /// one is available from [`Router::port`].
    pub fn bind(host: &str, port: u16) -> Result<Self, NetError> {
        let listener = TcpListener::bind(format_endpoint(host, port))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel();
        let reader_handles = Arc::new(Mutex::new(Vec::new()));

        let accept_peers = Arc::clone(&peers);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_readers = Arc::clone(&reader_handles);
        let accept_handle = thread::Builder::new()
            .name("lq-net-accept".to_string())
            .spawn(move || {
                accept_loop(
                    listener,
                    accept_peers,
                    events_tx,
                    accept_shutdown,
                    accept_readers,
                );
            })
            .map_err(NetError::Io)?;

        Ok(Self {
            port,
            peers,
            events: Mutex::new(events_rx),
            shutdown,
            accept_handle: Some(accept_handle),
            reader_handles,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait up to `timeout` for the next event from any peer.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<RouterEvent, RecvError> {
        let events = self.events.lock().unwrap();
        match events.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(RecvError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RecvError::Closed),
        }
    }

    /// Drain one pending event without blocking.
    pub fn try_recv(&self) -> Option<RouterEvent> {
        let events = self.events.lock().unwrap();
        events.try_recv().ok()
    }

    /// Send a payload to the peer with the given identity: identity frame
    /// first, payload frame second.
    pub fn send(&self, identity: &str, payload: &[u8]) -> Result<(), NetError> {
        let writer = {
            let peers = self.peers.lock().unwrap();
            peers
                .get(identity)
                .cloned()
                .ok_or_else(|| NetError::UnknownPeer(identity.to_string()))?
        };
        let mut stream = writer.lock().unwrap();
        write_frame(&mut *stream, identity.as_bytes())?;
        write_frame(&mut *stream, payload)?;
        Ok(())
    }

    /// Identities of every live connection.
    pub fn peer_identities(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Drop a peer's connection and forget it.
    pub fn disconnect_peer(&self, identity: &str) {
        if let Some(writer) = self.peers.lock().unwrap().remove(identity) {
            let _ = writer.lock().unwrap().shutdown(Shutdown::Both);
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        {
            let mut peers = self.peers.lock().unwrap();
            for (_, writer) in peers.drain() {
                let _ = writer.lock().unwrap().shutdown(Shutdown::Both);
            }
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let handles = {
            let mut guard = self.reader_handles.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn accept_loop(
    listener: TcpListener,
    peers: PeerMap,
    events_tx: mpsc::Sender<RouterEvent>,
    shutdown: Arc<AtomicBool>,
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _peer_addr)) => {
                if let Err(e) = register_peer(stream, &peers, &events_tx, &reader_handles) {
                    eprintln!("lq-net: rejected connection: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(_) => break,
        }
    }
}

fn register_peer(
    stream: TcpStream,
    peers: &PeerMap,
    events_tx: &mpsc::Sender<RouterEvent>,
    reader_handles: &Arc<Mutex<Vec<JoinHandle<()>>>>,
) -> Result<(), NetError> {
    stream.set_nodelay(true).ok();
    // Blocking reads after the nonblocking accept need the flag cleared on
    // the accepted stream.
    stream.set_nonblocking(false)?;

    // The handshake frame is expected immediately; a silent client must not
    // stall the accept loop.
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = stream.try_clone()?;
    let handshake = match crate::frame::read_frame_start(&mut reader)? {
        Some(frame) => frame,
        None => return Err(NetError::BadIdentity),
    };
    let identity = identity_from_frame(&handshake).ok_or(NetError::BadIdentity)?;
    stream.set_read_timeout(None)?;

    let writer = Arc::new(Mutex::new(stream));
    peers
        .lock()
        .unwrap()
        .insert(identity.clone(), Arc::clone(&writer));

    let peers = Arc::clone(peers);
    let events_tx = events_tx.clone();
    let handle = thread::Builder::new()
        .name(format!("lq-net-read-{identity}"))
        .spawn(move || {
            loop {
                match read_frame(&mut reader) {
                    Ok(payload) => {
                        if events_tx
                            .send(RouterEvent::Message {
                                identity: identity.clone(),
                                payload,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => {
                        peers.lock().unwrap().remove(&identity);
                        let _ = events_tx.send(RouterEvent::Disconnected { identity });
                        break;
                    }
                }
            }
        })
        .map_err(NetError::Io)?;

    reader_handles.lock().unwrap().push(handle);
    Ok(())
}
