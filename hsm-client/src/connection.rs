//! # HSM Connection
//!
//! Purpose: Own one TCP channel to the HSM together with the liveness
//! metadata the pool needs to decide whether it may be reused.
//!
//! ## Design Principles
//! 1. **Exclusive Ownership**: A `Connection` is moved between pool buckets,
//!    never shared; its pool state is whichever bucket holds it.
//! 2. **Pure Validity Check**: `check` only inspects state. The pool decides
//!    what to do with an invalid connection.
//! 3. **Poison on Failure**: Any I/O or framing failure marks the stream as
//!    desynchronised so it is never handed out again.

use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hsm_common::FrameCodec;
use socket2::SockRef;

use crate::client::{ClientError, ClientResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Canonical connection rotation period.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Canonical idle eviction period.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(5 * 60);

/// Age limits applied by the validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityPolicy {
    /// Connections older than this are rotated regardless of use.
    pub max_age: Duration,
    /// Connections unused for longer than this may have been dropped by the peer.
    pub max_idle: Duration,
}

impl Default for ValidityPolicy {
    fn default() -> Self {
        ValidityPolicy {
            max_age: DEFAULT_MAX_AGE,
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

/// Outcome of a validity check. Anything but `Valid` means "destroy".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Closed locally, disconnected, or shut down by the peer.
    Closed,
    /// A previous exchange failed and left the stream mid-frame.
    Broken,
    /// Older than `max_age`.
    Expired,
    /// Unused for longer than `max_idle`.
    Idle,
}

/// A single TCP channel to the HSM.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    created_at: Instant,
    last_used_at: Instant,
    closed: bool,
    broken: bool,
}

impl Connection {
    /// Wraps an already-configured stream.
    pub fn new(stream: TcpStream) -> Self {
        let now = Instant::now();
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            created_at: now,
            last_used_at: now,
            closed: false,
            broken: false,
        }
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Refreshes the last-use timestamp.
    pub fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
    }

    /// Writes one encoded request frame and reads one response frame.
    ///
    /// On failure the connection is marked broken: the stream position is
    /// unknown and the next reader would misparse it.
    pub fn exchange(&mut self, frame: &[u8], codec: &FrameCodec) -> ClientResult<String> {
        let result = self.round_trip(frame, codec);
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    fn round_trip(&mut self, frame: &[u8], codec: &FrameCodec) -> ClientResult<String> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(codec.decode(&mut self.stream)?)
    }

    /// Evaluates whether the connection may be handed out at `now`.
    pub fn check(&self, now: Instant, policy: &ValidityPolicy) -> Validity {
        if self.closed {
            return Validity::Closed;
        }
        if self.broken {
            return Validity::Broken;
        }
        if now.saturating_duration_since(self.created_at) > policy.max_age {
            return Validity::Expired;
        }
        if now.saturating_duration_since(self.last_used_at) > policy.max_idle {
            return Validity::Idle;
        }
        if !self.socket_is_open() {
            return Validity::Closed;
        }
        Validity::Valid
    }

    pub fn is_valid(&self, now: Instant, policy: &ValidityPolicy) -> bool {
        self.check(now, policy) == Validity::Valid
    }

    // A healthy idle request/response socket has nothing to read: EOF means the
    // peer shut down, and stray bytes mean the framing is out of step.
    fn socket_is_open(&self) -> bool {
        if self.stream.peer_addr().is_err() {
            return false;
        }
        if !matches!(self.stream.take_error(), Ok(None)) {
            return false;
        }
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let open = match self.stream.peek(&mut probe) {
            Ok(_) => false,
            Err(err) => err.kind() == ErrorKind::WouldBlock,
        };
        self.stream.set_nonblocking(false).is_ok() && open
    }

    /// A second handle to the socket, used to abort in-flight I/O on shutdown.
    pub(crate) fn shutdown_handle(&self) -> Option<TcpStream> {
        self.stream.try_clone().ok()
    }

    /// Closes the socket in both directions. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.closed = true;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.stream.peer_addr().ok())
            .field("closed", &self.closed)
            .field("broken", &self.broken)
            .finish()
    }
}

/// Creates new connections for the pool.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> ClientResult<Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> ClientResult<Connection> + Send + Sync,
{
    fn connect(&self) -> ClientResult<Connection> {
        self()
    }
}

/// TCP connection factory for a fixed HSM endpoint.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Read/write timeout applied to every socket.
    pub io_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpConnector {
            host: host.into(),
            port,
            connect_timeout: None,
            io_timeout: None,
        }
    }

    fn resolve(&self) -> ClientResult<Vec<SocketAddr>> {
        let invalid = || ClientError::InvalidAddress(format!("{}:{}", self.host, self.port));
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| invalid())?
            .collect();
        if addrs.is_empty() {
            return Err(invalid());
        }
        Ok(addrs)
    }

    fn open_stream(&self) -> ClientResult<TcpStream> {
        let mut last_err = None;
        for addr in self.resolve()? {
            let attempt = match self.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => ClientError::Transport(err),
            None => ClientError::InvalidAddress(format!("{}:{}", self.host, self.port)),
        })
    }
}

impl ConnectionFactory for TcpConnector {
    fn connect(&self) -> ClientResult<Connection> {
        let stream = self.open_stream()?;
        stream.set_read_timeout(self.io_timeout)?;
        stream.set_write_timeout(self.io_timeout)?;
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;
        Ok(Connection::new(stream))
    }
}
