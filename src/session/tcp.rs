//! Length-prefixed TCP stream transport.
//!
//! Inbound: `u32` big-endian length followed by one encoded image.
//! Outbound: one JSON `SessionMessage` per line.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::{SessionManager, SessionMessage, SessionTransport};
use crate::cancel::CancelToken;
use crate::error::DispatchError;
use crate::frame::{FramePayload, MAX_ENCODED_FRAME_BYTES};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Write half of a stream connection. Closing shuts the socket down both ways, which
/// also ends the connection's reader.
pub struct TcpTransport {
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SessionTransport for TcpTransport {
    fn send(&self, message: &SessionMessage) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("transport closed"));
        }
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&line)?;
        stream.flush()?;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        // the peer may already be gone
        let _ = stream.shutdown(Shutdown::Both);
    }
}

pub struct StreamHandle {
    pub addr: SocketAddr,
    join: JoinHandle<()>,
}

impl StreamHandle {
    /// Wait for the accept loop to exit. Cancel its token first.
    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| anyhow!("stream listener thread panicked"))
    }
}

/// Accepts stream connections, one session per connection.
pub struct StreamListener {
    addr: String,
    manager: SessionManager,
}

impl StreamListener {
    pub fn new(addr: impl Into<String>, manager: SessionManager) -> Self {
        Self {
            addr: addr.into(),
            manager,
        }
    }

    pub fn spawn(self, cancel: CancelToken) -> Result<StreamHandle> {
        let listener = TcpListener::bind(&self.addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let manager = self.manager;
        let join = thread::Builder::new()
            .name("stream-listener".to_string())
            .spawn(move || {
                if let Err(err) = accept_loop(listener, manager, cancel) {
                    log::error!("stream listener stopped: {}", err);
                }
            })?;
        log::info!("stream listener on {}", addr);
        Ok(StreamHandle { addr, join })
    }
}

fn accept_loop(listener: TcpListener, manager: SessionManager, cancel: CancelToken) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let manager = manager.clone();
                let spawned = thread::Builder::new()
                    .name(format!("stream-conn-{}", peer))
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, &manager) {
                            log::warn!("stream connection from {} ended: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn stream connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                cancel.wait(ACCEPT_POLL);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn serve_connection(mut stream: TcpStream, manager: &SessionManager) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let transport = Arc::new(TcpTransport::new(stream.try_clone()?));

    let lease = match manager.allocate(transport.clone()) {
        Ok(lease) => lease,
        Err(err) => {
            let _ = transport.send(&SessionMessage::Error {
                session_id: String::new(),
                message: err.to_string(),
            });
            transport.close();
            return Err(err.into());
        }
    };
    let session_id = lease.session_id;

    let outcome = read_frames(&mut stream, manager, &session_id, &transport);
    manager.release(&session_id);
    outcome
}

fn read_frames(
    stream: &mut TcpStream,
    manager: &SessionManager,
    session_id: &str,
    transport: &TcpTransport,
) -> Result<()> {
    loop {
        let mut prefix = [0u8; 4];
        match stream.read_exact(&mut prefix) {
            Ok(()) => {}
            // peer disconnect, or our own shutdown after eviction
            Err(_) if transport.is_closed() => return Ok(()),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 || len > MAX_ENCODED_FRAME_BYTES {
            let _ = transport.send(&SessionMessage::Error {
                session_id: session_id.to_string(),
                message: format!("frame length {} out of range", len),
            });
            return Err(anyhow!("invalid frame length {}", len));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;

        match manager.handle_frame(session_id, FramePayload::Encoded(body)) {
            Ok(()) => {}
            Err(DispatchError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}
