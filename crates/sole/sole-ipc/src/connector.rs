//! Secondary side: reach the primary, shake hands, push payloads.
//!
//! Every operation takes a deadline. Expiry is reported as
//! [`IpcError::Timeout`] and leaves the connector disconnected, so a caller
//! never has to reason about a half-open handshake.

use crate::error::IpcError;
use crate::listener::socket_path;
use crate::wire::{self, ConnectionKind, InitMessage};
use socket2::{Domain, SockAddr, Socket, Type};
use sole_core::{Identifier, jitter};
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub struct Connector {
    socket_path: PathBuf,
    identifier: Identifier,
    instance_id: u32,
    stream: Option<UnixStream>,
}

impl Connector {
    pub fn new(dir: &Path, identifier: Identifier, instance_id: u32) -> Self {
        Self {
            socket_path: socket_path(dir, &identifier),
            identifier,
            instance_id,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Connects and completes the handshake within `timeout`.
    ///
    /// Already connected is success. Attempts are spaced by a short random
    /// pause so secondaries started together don't hammer the primary in
    /// lockstep.
    pub fn connect(&mut self, timeout: Duration, kind: ConnectionKind) -> Result<(), IpcError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut stream = self.connect_socket(deadline)?;

        let init = InitMessage {
            server_identity: self.identifier.as_bytes().to_vec(),
            kind,
            instance_id: self.instance_id,
        };
        write_confirmed_message(&mut stream, &init.encode(), deadline)?;

        debug!(instance_id = self.instance_id, ?kind, "handshake complete");
        self.stream = Some(stream);
        Ok(())
    }

    /// Sends one framed payload and waits for both acknowledgements.
    pub fn send_message(&mut self, payload: &[u8], timeout: Duration) -> Result<(), IpcError> {
        let deadline = Instant::now() + timeout;
        let stream = self.stream.as_mut().ok_or(IpcError::NotConnected)?;

        let result = write_confirmed_message(stream, payload, deadline);
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    fn connect_socket(&self, deadline: Instant) -> Result<UnixStream, IpcError> {
        let addr = SockAddr::unix(&self.socket_path)?;
        loop {
            std::thread::sleep(jitter().min(remaining(deadline)));

            let left = remaining(deadline);
            if left.is_zero() {
                return Err(IpcError::Timeout);
            }

            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            match socket.connect_timeout(&addr, left) {
                Ok(()) => {
                    let stream = UnixStream::from(OwnedFd::from(socket));
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) => {
                    trace!(error = %e, path = %self.socket_path.display(), "connect attempt failed");
                    if remaining(deadline).is_zero() {
                        return Err(IpcError::Timeout);
                    }
                }
            }
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Header frame, then body frame, each confirmed by an ack.
fn write_confirmed_message(stream: &mut UnixStream, body: &[u8], deadline: Instant) -> Result<(), IpcError> {
    write_confirmed_frame(stream, &wire::encode_header(body.len() as u64), deadline)?;
    write_confirmed_frame(stream, body, deadline)
}

fn write_confirmed_frame(stream: &mut UnixStream, frame: &[u8], deadline: Instant) -> Result<(), IpcError> {
    let left = remaining(deadline);
    if left.is_zero() {
        return Err(IpcError::Timeout);
    }
    stream.set_write_timeout(Some(left))?;
    stream.write_all(frame).map_err(IpcError::from_transfer)?;
    stream.flush().map_err(IpcError::from_transfer)?;

    let left = remaining(deadline);
    if left.is_zero() {
        return Err(IpcError::Timeout);
    }
    stream.set_read_timeout(Some(left))?;
    let mut ack = [0u8; 1];
    match stream.read(&mut ack) {
        Ok(1) => Ok(()),
        Ok(_) => Err(IpcError::Closed),
        Err(e) => Err(IpcError::from_transfer(e)),
    }
}
