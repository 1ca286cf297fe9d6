//! # HSM Sync Client
//!
//! Purpose: Provide a blocking client for a Hardware Security Module that
//! speaks hex-length-prefixed ASCII commands over pooled TCP connections.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A fixed set of pre-established connections is
//!    borrowed and returned around every command.
//! 2. **Validate on Checkout**: Connections are re-checked on every borrow and
//!    return and replaced when stale or broken.
//! 3. **Bounded Retries**: Transient failures are absorbed with linear backoff;
//!    only exhaustion or cancellation reaches the caller.
//! 4. **Thread-per-Caller**: Every operation is synchronous; callers bring
//!    their own threads.

mod cancel;
mod client;
mod config;
mod connection;
mod executor;
mod pool;

pub use cancel::CancelToken;
pub use client::{ClientError, ClientResult, HealthReport, HsmClient};
pub use config::{ClientConfig, ConfigError, PoolSettings};
pub use connection::{Connection, ConnectionFactory, TcpConnector, Validity, ValidityPolicy};
pub use executor::{CommandExecutor, RetryPolicy};
pub use hsm_common::{FrameCodec, FrameError, Response, ResponseFields};
pub use pool::{ConnectionPool, PoolConfig, PoolStatus, PooledConnection};
