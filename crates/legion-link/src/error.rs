//! Error types for legion-link.
//!
//! Errors fall into three families: initialization failures (listen/connect),
//! wire decoding failures, and per-connection delivery failures. Only the
//! first family ever reaches a caller as a hard failure; decode and send
//! errors are logged and contained at the connection that produced them.

use std::net::SocketAddr;

use thiserror::Error;

use crate::capture::CaptureError;
use crate::coordinator::SessionState;
use crate::protocol::DecodeError;
use crate::transport::ConnectionId;

/// The main error type for legion-link operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Initialization Errors ===
    /// The commander could not bind its listening socket.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// Address we tried to bind.
        addr: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A field node could not reach its commander.
    #[error("failed to connect to commander at {addr}: {source}")]
    Connect {
        /// Address we tried to dial.
        addr: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Connecting to the commander did not complete in time.
    #[error("timed out connecting to commander at {addr}")]
    ConnectTimeout {
        /// Address we tried to dial.
        addr: String,
    },

    /// A field node was initialized without a commander address.
    #[error("field node requires a commander address")]
    MissingTargetAddress,

    /// The commander address could not be parsed.
    #[error("invalid commander address '{addr}'")]
    InvalidAddress {
        /// The address as given.
        addr: String,
    },

    /// The session was torn down while it was still being set up.
    #[error("initialization aborted by teardown")]
    InitializationAborted,

    /// The operation is not allowed in the current session state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// What was attempted.
        operation: &'static str,
        /// The state the coordinator was in.
        state: SessionState,
    },

    /// The operation is reserved for the commander role.
    #[error("only the commander can {operation}")]
    NotCommander {
        /// What was attempted.
        operation: &'static str,
    },

    // === Wire Errors ===
    /// An inbound record could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A message could not be handed to a connection.
    #[error("send on connection {connection} failed: {reason}")]
    Send {
        /// The connection that failed.
        connection: ConnectionId,
        /// Why the send failed.
        reason: String,
    },

    // === Device Errors ===
    /// The local capture layer failed.
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// Socket or file system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for legion-link operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a listen error for the given address.
    #[must_use]
    pub fn listen(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Listen {
            addr: addr.to_string(),
            source,
        }
    }

    /// Create a connect error for the given address.
    #[must_use]
    pub fn connect(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    /// Create a send error for a connection.
    #[must_use]
    pub fn send(connection: ConnectionId, reason: impl Into<String>) -> Self {
        Self::Send {
            connection,
            reason: reason.into(),
        }
    }

    /// Check if this error aborted an `initialize` attempt.
    ///
    /// These are recoverable by calling `initialize` again once the
    /// coordinator is back in the `Uninitialized` state.
    #[must_use]
    pub fn is_initialization_error(&self) -> bool {
        matches!(
            self,
            Self::Listen { .. }
                | Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::MissingTargetAddress
                | Self::InvalidAddress { .. }
                | Self::InitializationAborted
        )
    }

    /// Check if this error is a per-connection delivery failure.
    #[must_use]
    pub fn is_send_error(&self) -> bool {
        matches!(self, Self::Send { .. })
    }
}
