//! # Synchronous Client API
//!
//! Purpose: Expose the operations the service layer consumes: send a
//! command, report pool occupancy, and probe HSM health.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `HsmClient` hides pooling, framing and retries.
//! 2. **Explicit Lifecycle**: The client is constructed and shut down by its
//!    owner; there is no global pool.
//! 3. **Shared Field Convention**: Every command reads the response and error
//!    codes at the same body offsets (see `hsm_common::Response`).

use std::time::Duration;

use hsm_common::{FrameError, Response};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::{ClientConfig, ConfigError};
use crate::connection::ConnectionFactory;
use crate::executor::CommandExecutor;
use crate::pool::{ConnectionPool, PoolStatus};

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No connection became available within the borrow timeout.
    #[error("connection pool exhausted - timeout after {timeout:?}")]
    PoolExhausted { timeout: Duration },

    /// The pool has been shut down.
    #[error("connection pool is shut down")]
    PoolClosed,

    /// Malformed response framing.
    #[error("protocol error: {0}")]
    Protocol(FrameError),

    /// Socket-level failure (reset, timeout, broken pipe).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The command cannot be framed.
    #[error("cannot encode command: {0}")]
    Encoding(FrameError),

    /// Every attempt failed; carries the last cause.
    #[error("command failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    /// The wait was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Host/port could not be resolved to a socket address.
    #[error("invalid address {0}")]
    InvalidAddress(String),

    /// The HSM answered with a response code other than the expected one.
    #[error("unexpected response code (expected {expected}, got {actual:?})")]
    UnexpectedResponse { expected: &'static str, actual: String },

    /// The HSM reported a non-zero error code.
    #[error("HSM error code {code}")]
    Device { code: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => ClientError::Transport(err),
            err if err.is_encoding() => ClientError::Encoding(err),
            err => ClientError::Protocol(err),
        }
    }
}

impl ClientError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ClientError::Cancelled | ClientError::PoolClosed | ClientError::Encoding(_)
        )
    }
}

/// No-op command used for health checks.
pub const HEALTH_COMMAND: &str = "NC";

/// Health probe outcome, shaped for the service's health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub connected: bool,
    pub status: &'static str,
    pub message: &'static str,
}

impl HealthReport {
    fn from_connected(connected: bool) -> Self {
        if connected {
            HealthReport {
                connected,
                status: "UP",
                message: "HSM is healthy",
            }
        } else {
            HealthReport {
                connected,
                status: "DOWN",
                message: "HSM connection failed",
            }
        }
    }
}

/// Synchronous HSM client with connection pooling.
pub struct HsmClient {
    executor: CommandExecutor,
    cancel: CancelToken,
}

impl HsmClient {
    /// Validates `config`, warms the pool and returns the client.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        info!(host = %config.host, port = config.port, "HSM client initializing");
        Ok(Self::with_factory(&config, config.connector()))
    }

    /// Builds a client over a custom connection factory. `config` is not
    /// validated.
    pub fn with_factory<F>(config: &ClientConfig, factory: F) -> Self
    where
        F: ConnectionFactory + 'static,
    {
        let pool = ConnectionPool::initialize(config.pool_config(), factory);
        HsmClient {
            executor: CommandExecutor::new(pool, config.codec(), config.retry_policy()),
            cancel: CancelToken::new(),
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Sends an unframed command and returns the full response frame.
    pub fn send_command(&self, command: &str) -> ClientResult<Response> {
        self.executor.execute_cancellable(command, &self.cancel)
    }

    /// Like `send_command`, aborting when `cancel` fires.
    pub fn send_command_cancellable(&self, command: &str, cancel: &CancelToken) -> ClientResult<Response> {
        self.executor.execute_cancellable(command, cancel)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.executor.pool().status()
    }

    /// Sends the no-op command; true iff the HSM answers `ND` / `00`.
    pub fn test_connection(&self) -> bool {
        let response = match self.send_command(HEALTH_COMMAND) {
            Ok(response) => response,
            Err(err) => {
                error!("HSM connection test failed: {}", err);
                return false;
            }
        };

        let Some(fields) = response.fields() else {
            error!(response = %response, "response body too short");
            return false;
        };

        if fields.is_success("ND") {
            info!("HSM connection test successful");
            true
        } else {
            warn!(
                response_code = fields.response_code,
                error_code = fields.error_code,
                "HSM connection test failed"
            );
            false
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::from_connected(self.test_connection())
    }

    /// Asks the HSM for `length` random hex characters.
    pub fn generate_random_hex(&self, length: usize) -> ClientResult<String> {
        info!("generating {} random hex characters", length);
        let response = self.send_command(&format!("NOX{:03}", length))?;

        let fields = response.fields().ok_or_else(|| ClientError::UnexpectedResponse {
            expected: "NP",
            actual: response.body().to_string(),
        })?;
        if fields.response_code != "NP" {
            error!(response_code = fields.response_code, "unexpected response code");
            return Err(ClientError::UnexpectedResponse {
                expected: "NP",
                actual: fields.response_code.to_string(),
            });
        }
        if fields.error_code != hsm_common::ERROR_CODE_OK {
            error!(error_code = fields.error_code, "HSM error code");
            return Err(ClientError::Device {
                code: fields.error_code.to_string(),
            });
        }

        info!("generated {} hex characters", fields.payload.len());
        Ok(fields.payload.to_string())
    }

    /// Aborts in-flight retries and closes every pooled connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.executor.pool().shutdown();
    }
}
