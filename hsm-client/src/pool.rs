//! # Connection Pool
//!
//! Purpose: Keep a fixed set of pre-established HSM connections and hand
//! each one to at most one caller at a time.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Connections are created at warm-up and
//!    replaced one-for-one when they fail validation.
//! 2. **Single State Machine**: The available queue and the borrowed set live
//!    behind one mutex, so moving a connection between them is atomic.
//! 3. **Availability over Strictness**: Factory failures shrink the pool and
//!    are logged; they never fail warm-up or `return`.
//! 4. **RAII Return**: `PooledConnection` returns itself on drop.
//!
//! ## Known Latency Tail
//!
//! Replacing an invalid connection during `borrow` calls the factory
//! synchronously, outside the borrow timeout. A slow connect makes `borrow`
//! overrun its nominal timeout by up to the connect timeout.
//!
//! ## Cancellable Waits
//!
//! A cancellable borrow re-checks its token every `CANCEL_POLL_INTERVAL`
//! instead of being woken by `CancelToken::cancel`, so a token never has to
//! know which pools are waiting on it. Cancellation is observed within one
//! interval, and each blocked borrower retakes the pool lock at that rate.

use std::collections::{HashMap, VecDeque};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hsm_common::FrameCodec;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::client::{ClientError, ClientResult};
use crate::connection::{Connection, ConnectionFactory, Validity, ValidityPolicy};

/// Canonical pool size.
pub const DEFAULT_CAPACITY: usize = 5;

/// Canonical borrow timeout.
pub const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on how long a cancellable borrow waits between token checks.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fixed number of connection slots.
    pub capacity: usize,
    /// Warm-up yielding fewer connections than this is logged as an error.
    pub min_size: usize,
    /// How long `borrow` waits for an available connection.
    pub borrow_timeout: Duration,
    /// Age limits for the validity check.
    pub validity: ValidityPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: DEFAULT_CAPACITY,
            min_size: 1,
            borrow_timeout: DEFAULT_BORROW_TIMEOUT,
            validity: ValidityPolicy::default(),
        }
    }
}

/// Point-in-time pool occupancy. Racy by nature: do not use it to predict
/// whether the next borrow will succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub available: usize,
    pub borrowed: usize,
}

struct PoolState {
    available: VecDeque<Connection>,
    // Borrowed connection ids, each with a cloned socket handle so shutdown
    // can abort I/O on connections it does not own.
    borrowed: HashMap<u64, Option<TcpStream>>,
    closed: bool,
}

impl PoolState {
    fn counts(&self) -> (usize, usize) {
        (self.available.len(), self.borrowed.len())
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: Box<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    available_cv: Condvar,
}

/// Connection pool handle. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool and warms up `config.capacity` connections.
    ///
    /// A factory failure skips that slot; the pool may start degraded.
    pub fn initialize<F>(config: PoolConfig, factory: F) -> Self
    where
        F: ConnectionFactory + 'static,
    {
        let capacity = config.capacity;
        info!(size = capacity, "initializing HSM connection pool");

        let mut available = VecDeque::with_capacity(capacity);
        for slot in 1..=capacity {
            match factory.connect() {
                Ok(conn) => {
                    info!(connection = conn.id(), "created HSM connection {}/{}", slot, capacity);
                    available.push_back(conn);
                }
                Err(err) => {
                    error!("failed to create HSM connection {}/{}: {}", slot, capacity, err);
                }
            }
        }

        info!(connections = available.len(), "HSM connection pool initialized");
        if available.len() < config.min_size {
            error!(
                connections = available.len(),
                min_size = config.min_size,
                "HSM connection pool started below its minimum size"
            );
        }

        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    available,
                    borrowed: HashMap::with_capacity(capacity),
                    closed: false,
                }),
                available_cv: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows a connection, waiting up to the configured borrow timeout.
    pub fn borrow(&self) -> ClientResult<PooledConnection> {
        self.borrow_inner(None)
    }

    /// Like `borrow`, but fails with `Cancelled` once `cancel` fires.
    pub fn borrow_cancellable(&self, cancel: &CancelToken) -> ClientResult<PooledConnection> {
        self.borrow_inner(Some(cancel))
    }

    fn borrow_inner(&self, cancel: Option<&CancelToken>) -> ClientResult<PooledConnection> {
        let timeout = self.inner.config.borrow_timeout;
        let deadline = Instant::now() + timeout;

        let candidate = {
            let mut state = self.inner.state.lock();
            debug!(available = state.available.len(), "borrowing connection from pool");
            loop {
                if state.closed {
                    return Err(ClientError::PoolClosed);
                }
                if cancel.map_or(false, CancelToken::is_cancelled) {
                    return Err(ClientError::Cancelled);
                }
                if let Some(conn) = state.available.pop_front() {
                    // Reserve the slot before releasing the lock.
                    state.borrowed.insert(conn.id(), conn.shutdown_handle());
                    break conn;
                }

                let now = Instant::now();
                if now >= deadline {
                    error!("no available connection in pool after {:?}", timeout);
                    return Err(ClientError::PoolExhausted { timeout });
                }
                let wake_at = match cancel {
                    Some(_) => deadline.min(now + CANCEL_POLL_INTERVAL),
                    None => deadline,
                };
                self.inner.available_cv.wait_until(&mut state, wake_at);
            }
        };

        let conn = self.checkout(candidate)?;
        Ok(PooledConnection {
            pool: self.clone(),
            conn: Some(conn),
        })
    }

    // Validates a reserved candidate, replacing it when invalid.
    fn checkout(&self, mut conn: Connection) -> ClientResult<Connection> {
        let validity = conn.check(Instant::now(), &self.inner.config.validity);
        if validity != Validity::Valid {
            warn!(connection = conn.id(), reason = ?validity, "invalid connection detected, creating new one");
            let stale_id = conn.id();
            conn.close();

            let replacement = self.inner.factory.connect();
            let mut state = self.inner.state.lock();
            state.borrowed.remove(&stale_id);
            conn = match replacement {
                Ok(mut fresh) if state.closed => {
                    drop(state);
                    fresh.close();
                    return Err(ClientError::PoolClosed);
                }
                Ok(fresh) => {
                    state.borrowed.insert(fresh.id(), fresh.shutdown_handle());
                    fresh
                }
                Err(err) => {
                    drop(state);
                    error!("failed to replace invalid connection: {}", err);
                    return Err(err);
                }
            };
        }

        conn.touch(Instant::now());
        let (available, borrowed) = self.inner.state.lock().counts();
        debug!(connection = conn.id(), available, borrowed, "connection borrowed");
        Ok(conn)
    }

    /// Returns a borrowed connection. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    fn give_back(&self, mut conn: Connection) {
        let tracked = {
            let mut state = self.inner.state.lock();
            state.borrowed.remove(&conn.id()).is_some() && !state.closed
        };
        if !tracked {
            debug!(connection = conn.id(), "discarding connection unknown to the pool");
            conn.close();
            return;
        }

        let now = Instant::now();
        let validity = conn.check(now, &self.inner.config.validity);
        if validity == Validity::Valid {
            conn.touch(now);
            self.push_available(conn);
            return;
        }

        warn!(connection = conn.id(), reason = ?validity, "returning invalid connection, creating new one");
        conn.close();
        match self.inner.factory.connect() {
            Ok(fresh) => self.push_available(fresh),
            Err(err) => error!("failed to recreate connection: {}", err),
        }
    }

    fn push_available(&self, mut conn: Connection) {
        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            conn.close();
            return;
        }
        let id = conn.id();
        state.available.push_back(conn);
        let (available, borrowed) = state.counts();
        drop(state);

        self.inner.available_cv.notify_one();
        debug!(connection = id, available, borrowed, "connection returned");
    }

    /// Closes every connection and rejects further borrows. Idempotent.
    pub fn shutdown(&self) {
        let (available, borrowed) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.available),
                std::mem::take(&mut state.borrowed),
            )
        };
        self.inner.available_cv.notify_all();

        info!("shutting down HSM connection pool");
        for mut conn in available {
            conn.close();
        }
        for handle in borrowed.into_values().flatten() {
            let _ = handle.shutdown(Shutdown::Both);
        }
        info!("HSM connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Snapshot of pool occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            capacity: self.inner.config.capacity,
            available: state.available.len(),
            borrowed: state.borrowed.len(),
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, Connection::id)
    }

    /// Sends one encoded frame and reads the response frame.
    pub fn exchange(&mut self, frame: &[u8], codec: &FrameCodec) -> ClientResult<String> {
        match self.conn.as_mut() {
            Some(conn) => conn.exchange(frame, codec),
            None => Err(ClientError::PoolClosed),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}
