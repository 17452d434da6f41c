//! The primary's accept/read loop.
//!
//! One thread runs a current-thread tokio runtime. A reader task per
//! connection forwards chunks of at most [`READ_CHUNK`] bytes over a bounded
//! queue to the serve loop, which owns a table of connections keyed by
//! token and feeds each chunk to that connection's [`ConnectionSession`]
//! right away. The queue is shared and bounded, so a peer that floods can
//! only take its turn alongside everyone else. Acknowledgements are
//! counted per connection and written by a small writer task.

use crate::error::IpcError;
use crate::events::InstanceEvents;
use crate::session::{ConnectionSession, HandshakePolicy, SessionAction};
use crate::wire::ACK;
use sole_core::Identifier;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 4096;

/// Chunks in flight between all reader tasks and the serve loop.
const CHUNK_QUEUE: usize = 64;

/// Pause after a failed `accept` (e.g. out of descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const ACK_BURST: [u8; 64] = [ACK; 64];

/// Path of the primary's endpoint for `identifier` inside `dir`.
pub fn socket_path(dir: &Path, identifier: &Identifier) -> PathBuf {
    dir.join(identifier.as_str())
}

/// Who may connect to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketAccess {
    /// Only the user that owns the primary.
    User,
    /// Every local user.
    World,
}

impl SocketAccess {
    fn mode(self) -> u32 {
        match self {
            SocketAccess::User => 0o700,
            SocketAccess::World => 0o777,
        }
    }
}

/// Stops a listener blocked in [`Listener::run`] from another thread.
///
/// Waking never blocks, and any number of wakes before the loop notices
/// them count as one.
#[derive(Debug, Clone)]
pub struct ListenerWaker(Arc<watch::Sender<bool>>);

impl ListenerWaker {
    pub fn wake(&self) {
        self.0.send_replace(true);
    }
}

enum ConnEvent {
    Data(u64, Vec<u8>),
    Closed(u64),
}

struct Connection {
    session: ConnectionSession,
    acks: watch::Sender<u64>,
    acks_owed: u64,
    accepted_at: Instant,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Both halves go away with their tasks, which closes the socket.
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Default)]
struct Sessions {
    connections: HashMap<u64, Connection>,
    next_token: u64,
    actions: Vec<SessionAction>,
}

impl Sessions {
    fn insert(&mut self, stream: tokio::net::UnixStream, chunks: mpsc::Sender<ConnEvent>) {
        let token = self.next_token;
        self.next_token += 1;

        let (read_half, write_half) = stream.into_split();
        let (acks, owed) = watch::channel(0u64);
        let reader = tokio::spawn(read_chunks(token, read_half, chunks));
        let writer = tokio::spawn(write_acks(token, write_half, owed));

        self.connections.insert(
            token,
            Connection {
                session: ConnectionSession::new(),
                acks,
                acks_owed: 0,
                accepted_at: Instant::now(),
                reader,
                writer,
            },
        );
        debug!(token, "accepted connection");
    }

    fn on_data(&mut self, token: u64, bytes: &[u8], policy: &HandshakePolicy, sink: &mut dyn InstanceEvents) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.session.receive(bytes);

        self.actions.clear();
        let advanced = conn.session.advance(policy, &mut self.actions);
        for action in self.actions.drain(..) {
            match action {
                SessionAction::Ack => conn.acks_owed += 1,
                SessionAction::InstanceStarted => sink.instance_started(),
                SessionAction::Message { instance_id, payload } => {
                    trace!(token, instance_id, len = payload.len(), "message received");
                    sink.message_received(instance_id, payload);
                }
            }
        }

        if let Err(reason) = advanced {
            debug!(token, %reason, "handshake rejected, closing");
            self.close(token);
            return;
        }
        conn.acks.send_replace(conn.acks_owed);
    }

    fn on_closed(&mut self, token: u64) {
        if let Some(conn) = self.connections.get(&token) {
            if conn.session.buffered() > 0 {
                debug!(token, discarded = conn.session.buffered(), "peer closed mid-frame");
            }
        }
        self.close(token);
    }

    /// Earliest moment a connection still in the handshake runs out of time.
    fn handshake_deadline(&self, policy: &HandshakePolicy) -> Option<Instant> {
        self.connections
            .values()
            .filter(|c| c.session.stage().is_handshake())
            .map(|c| c.accepted_at + policy.handshake_timeout)
            .min()
    }

    fn reap_stalled_handshakes(&mut self, policy: &HandshakePolicy) {
        let now = Instant::now();
        let stalled: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| c.session.stage().is_handshake() && now >= c.accepted_at + policy.handshake_timeout)
            .map(|(token, _)| *token)
            .collect();
        for token in stalled {
            debug!(token, "handshake timed out, closing");
            self.close(token);
        }
    }

    fn close(&mut self, token: u64) {
        if self.connections.remove(&token).is_some() {
            debug!(token, "connection closed");
        }
    }
}

pub struct Listener {
    listener: std::os::unix::net::UnixListener,
    path: PathBuf,
    policy: HandshakePolicy,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Listener {
    /// Binds the endpoint for `policy.identifier` inside `dir`.
    ///
    /// A leftover socket file from a primary that crashed is removed first.
    pub fn bind(dir: &Path, policy: HandshakePolicy, access: SocketAccess) -> Result<Self, IpcError> {
        let path = socket_path(dir, &policy.identifier);
        let bind_err = |source: io::Error| IpcError::Bind {
            path: path.display().to_string(),
            source,
        };

        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale endpoint"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let listener = std::os::unix::net::UnixListener::bind(&path).map_err(bind_err)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(access.mode())).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        info!(path = %path.display(), ?access, "listening for secondary instances");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            path,
            policy,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn waker(&self) -> ListenerWaker {
        ListenerWaker(Arc::clone(&self.shutdown))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Services connections on the calling thread until a [`ListenerWaker`]
    /// fires. Open connections are dropped on return.
    pub fn run(&mut self, sink: &mut dyn InstanceEvents) -> Result<(), IpcError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let result = runtime.block_on(self.serve(sink));
        // Re-arm so a later run starts fresh.
        self.shutdown.send_replace(false);
        result
    }

    async fn serve(&self, sink: &mut dyn InstanceEvents) -> Result<(), IpcError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        let listener = tokio::net::UnixListener::from_std(self.listener.try_clone()?)?;
        let (chunk_tx, mut chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let mut sessions = Sessions::default();
        let mut accept_paused_until: Option<Instant> = None;

        loop {
            let timer = next_timer(sessions.handshake_deadline(&self.policy), accept_paused_until);

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow_and_update() {
                        debug!(open = sessions.connections.len(), "listener woken, stopping");
                        return Ok(());
                    }
                }
                accepted = listener.accept(), if accept_paused_until.is_none() => match accepted {
                    Ok((stream, _)) => sessions.insert(stream, chunk_tx.clone()),
                    Err(e) => {
                        warn!(error = %e, backoff = ?ACCEPT_BACKOFF, "accept failed");
                        accept_paused_until = Some(Instant::now() + ACCEPT_BACKOFF);
                    }
                },
                Some(event) = chunk_rx.recv() => match event {
                    ConnEvent::Data(token, bytes) => sessions.on_data(token, &bytes, &self.policy, sink),
                    ConnEvent::Closed(token) => sessions.on_closed(token),
                },
                () = sleep_until(timer) => {
                    if accept_paused_until.is_some_and(|t| Instant::now() >= t) {
                        accept_paused_until = None;
                    }
                    sessions.reap_stalled_handshakes(&self.policy);
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn next_timer(handshake: Option<Instant>, accept_paused_until: Option<Instant>) -> Option<Instant> {
    match (handshake, accept_paused_until) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

async fn read_chunks(token: u64, mut stream: OwnedReadHalf, chunks: mpsc::Sender<ConnEvent>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let event = match stream.read(&mut buf).await {
            Ok(0) => ConnEvent::Closed(token),
            Ok(n) => ConnEvent::Data(token, buf[..n].to_vec()),
            Err(e) => {
                debug!(token, error = %e, "read failed");
                ConnEvent::Closed(token)
            }
        };
        let closed = matches!(event, ConnEvent::Closed(_));
        if chunks.send(event).await.is_err() || closed {
            return;
        }
    }
}

async fn write_acks(token: u64, mut stream: OwnedWriteHalf, mut owed: watch::Receiver<u64>) {
    let mut written = 0u64;
    while owed.changed().await.is_ok() {
        let target = *owed.borrow_and_update();
        while written < target {
            let n = (target - written).min(ACK_BURST.len() as u64) as usize;
            if let Err(e) = stream.write_all(&ACK_BURST[..n]).await {
                debug!(token, error = %e, "ack write failed");
                return;
            }
            written += n as u64;
        }
    }
}
