//! TCP transport between a commander and its field nodes.
//!
//! Each link is a persistent TCP stream carrying newline-delimited
//! [`ControlMessage`] records in both directions. A link runs as two tasks:
//! a reader that decodes records and forwards them as [`LinkEvent`]s, and a
//! writer that drains a bounded outbound queue. [`Connection`] is the
//! cloneable sending side; sends never wait on the network.
//!
//! There is no reconnect. When a link fails it is marked closed and the
//! reader reports [`LinkEvent::Closed`]; recovery is up to the caller.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::protocol::{ControlMessage, DecodeError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Which physical-layer path a field node dials. Only the port differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolHint {
    /// Primary low-latency path.
    #[default]
    Fast,
    /// Fallback path.
    Alternate,
}

impl ProtocolHint {
    /// The port this hint maps to under the given network settings.
    #[must_use]
    pub fn port(self, network: &NetworkConfig) -> u16 {
        match self {
            Self::Fast => network.fast_port,
            Self::Alternate => network.alternate_port,
        }
    }
}

impl std::fmt::Display for ProtocolHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Alternate => write!(f, "alternate"),
        }
    }
}

/// Process-unique identifier of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-link limits.
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    /// Longest a single write may stall before the link is declared dead.
    pub write_timeout: Duration,
    /// Messages queued per link before sends start failing.
    pub outbound_buffer: usize,
    /// Largest accepted inbound record, in bytes.
    pub max_frame_bytes: usize,
}

impl From<&NetworkConfig> for LinkSettings {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            write_timeout: Duration::from_millis(network.write_timeout_ms),
            outbound_buffer: network.outbound_buffer,
            max_frame_bytes: network.max_frame_bytes,
        }
    }
}

/// A decoded inbound message with its local receipt time.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Link the message arrived on.
    pub connection: ConnectionId,
    /// Local clock reading when the record finished arriving.
    pub received_at: i64,
    /// The message itself.
    pub message: ControlMessage,
}

/// What a link reports to its owner.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A record arrived and decoded cleanly.
    Message(Inbound),
    /// The link hit EOF or a read error and will deliver nothing more.
    Closed(ConnectionId),
}

/// Sending side of a link. Clones share the same queue and liveness flag.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<ControlMessage>,
    open: Arc<AtomicBool>,
}

impl Connection {
    /// A connection whose outbound queue is a plain channel.
    ///
    /// Used for in-process links; the returned receiver sees every message
    /// sent. Dropping the receiver makes further sends fail.
    #[must_use]
    pub fn channel(peer: SocketAddr, buffer: usize) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let conn = Self {
            id: ConnectionId::next(),
            peer,
            outbound: tx,
            open: Arc::new(AtomicBool::new(true)),
        };
        (conn, rx)
    }

    /// This link's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the link is still believed usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Mark the link dead. Further sends fail immediately.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Wait until the writer has taken every queued message, or `limit`
    /// passes. Returns whether the queue drained.
    pub async fn drain(&self, limit: Duration) -> bool {
        let drained = async {
            while self.is_open() && self.outbound.capacity() < self.outbound.max_capacity() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }

    /// Queue a message for delivery without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Send`] if the link is closed or its queue is full;
    /// in both cases the link is marked dead.
    pub fn send(&self, message: &ControlMessage) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::send(self.id, "connection closed"));
        }
        match self.outbound.try_send(message.clone()) {
            Ok(()) => {
                trace!(connection = %self.id, kind = %message.kind, "Queued message");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.close();
                Err(Error::send(self.id, "outbound queue full"))
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(Error::send(self.id, "writer stopped"))
            }
        }
    }
}

/// The commander's set of live links, shared between tasks.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSet {
    inner: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl ConnectionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link.
    pub async fn insert(&self, connection: Connection) {
        self.inner.write().await.insert(connection.id(), connection);
    }

    /// Remove a link, returning it if present.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.write().await.remove(&id)
    }

    /// Look up a link.
    pub async fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.read().await.get(&id).cloned()
    }

    /// Copy of the current links, safe to iterate while others mutate the set.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Close and drop every link.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        for connection in inner.values() {
            connection.close();
        }
        inner.clear();
    }

    /// Number of links.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the set is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Turn a user-entered commander address into something dialable.
///
/// A bare host or IP gets the hint's port; an explicit `host:port` is kept.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] for an empty address.
pub fn resolve_target(target: &str, port: u16) -> Result<String> {
    let target = target.trim();
    if target.is_empty() {
        return Err(Error::InvalidAddress {
            addr: target.to_string(),
        });
    }
    if target.parse::<SocketAddr>().is_ok() {
        return Ok(target.to_string());
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port).to_string());
    }
    if let Some((host, p)) = target.rsplit_once(':') {
        if !host.is_empty() && p.parse::<u16>().is_ok() {
            return Ok(target.to_string());
        }
        return Err(Error::InvalidAddress {
            addr: target.to_string(),
        });
    }
    Ok(format!("{target}:{port}"))
}

/// Dial a commander.
///
/// # Errors
///
/// Returns [`Error::Connect`] if the connection is refused or fails, and
/// [`Error::ConnectTimeout`] if `timeout` is set and elapses first.
pub async fn connect(addr: &str, timeout: Option<Duration>) -> Result<TcpStream> {
    debug!(%addr, ?timeout, "Connecting to commander");
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout {
                addr: addr.to_string(),
            })?,
        None => TcpStream::connect(addr).await,
    }
    .map_err(|e| Error::connect(addr, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle on commander link");
    }
    info!(%addr, "Connected to commander");
    Ok(stream)
}

/// Bind the commander's listening socket.
///
/// # Errors
///
/// Returns [`Error::Listen`] if the address cannot be bound.
pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::listen(addr, e))?;
    info!(addr = %listener.local_addr().unwrap_or(addr), "Listening for field nodes");
    Ok(listener)
}

/// Start the reader and writer tasks for an established stream.
///
/// Both tasks are spawned on `tasks`, so dropping or aborting the set tears
/// the link down.
pub fn spawn_link(
    stream: TcpStream,
    settings: LinkSettings,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<LinkEvent>,
    tasks: &mut JoinSet<()>,
) -> Result<Connection> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let (connection, mut outbound) = Connection::channel(peer, settings.outbound_buffer);
    let id = connection.id();

    let writer_open = Arc::clone(&connection.open);
    tasks.spawn(async move {
        while let Some(message) = outbound.recv().await {
            let line = match message.encode() {
                Ok(line) => line,
                Err(e) => {
                    warn!(connection = %id, error = %e, "Dropping unencodable message");
                    continue;
                }
            };
            match tokio::time::timeout(settings.write_timeout, write_half.write_all(&line)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(connection = %id, %peer, error = %e, "Write failed, closing link");
                    break;
                }
                Err(_) => {
                    warn!(connection = %id, %peer, "Write stalled, closing link");
                    break;
                }
            }
        }
        writer_open.store(false, Ordering::SeqCst);
        let _ = write_half.shutdown().await;
        debug!(connection = %id, "Link writer stopped");
    });

    let reader_open = Arc::clone(&connection.open);
    tasks.spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        loop {
            match read_frame(&mut reader, &mut buf, settings.max_frame_bytes).await {
                Ok(Frame::Record) => {
                    let received_at = clock.now_ms();
                    match ControlMessage::decode(&buf) {
                        Ok(message) => {
                            trace!(connection = %id, kind = %message.kind, "Received message");
                            let inbound = Inbound {
                                connection: id,
                                received_at,
                                message,
                            };
                            if events.send(LinkEvent::Message(inbound)).await.is_err() {
                                debug!(connection = %id, "Link owner gone, stopping reader");
                                return;
                            }
                        }
                        Err(DecodeError::Empty) => {}
                        Err(e) => {
                            warn!(connection = %id, %peer, error = %e, "Dropping malformed record");
                        }
                    }
                }
                Ok(Frame::Oversized(len)) => {
                    let e = DecodeError::FrameTooLarge {
                        len,
                        max: settings.max_frame_bytes,
                    };
                    warn!(connection = %id, %peer, error = %e, "Dropping oversized record");
                }
                Ok(Frame::Eof) => {
                    info!(connection = %id, %peer, "Link closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(connection = %id, %peer, error = %e, "Link read failed");
                    break;
                }
            }
        }
        reader_open.store(false, Ordering::SeqCst);
        let _ = events.send(LinkEvent::Closed(id)).await;
    });

    Ok(connection)
}

/// Accept field nodes until the task is cancelled.
///
/// Every accepted stream becomes a link in `connections`; link tasks live in
/// a set owned by this loop and die with it.
pub async fn accept_loop(
    listener: TcpListener,
    connections: ConnectionSet,
    settings: LinkSettings,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut links = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Could not disable Nagle on field link");
                    }
                    match spawn_link(stream, settings, Arc::clone(&clock), events.clone(), &mut links) {
                        Ok(connection) => {
                            info!(connection = %connection.id(), %peer, "Field node connected");
                            connections.insert(connection).await;
                        }
                        Err(e) => warn!(%peer, error = %e, "Failed to set up field link"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            },
            Some(_) = links.join_next(), if !links.is_empty() => {}
        }
    }
}

enum Frame {
    Record,
    Oversized(usize),
    Eof,
}

/// Read one `\n`-terminated record into `buf`, refusing to buffer more than
/// `max` bytes. An oversized record is consumed and discarded.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    buf.clear();
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= max {
        return Ok(Frame::Record);
    }

    let mut discarded = n;
    loop {
        buf.clear();
        let m = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        discarded += m;
        if m == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(Frame::Oversized(discarded))
}
