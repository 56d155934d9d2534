// src/core/errors.rs

//! Defines the primary error type for the entire client.

use std::num::{ParseFloatError, ParseIntError};
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the client.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The peer closed the socket while the connection was still in use.
    #[error("Unexpected connection closure")]
    ConnectionClosed,

    /// Raised by the decoder when the buffer does not yet hold a full frame.
    /// It never reaches callers: the codec turns it into `Ok(None)`.
    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error reply sent by the server (e.g. `ERR`, `WRONGTYPE`).
    #[error("{0}")]
    Server(String),

    #[error("Command timed out after {timeout_ms}ms: {command}")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("Command cancelled: {command}")]
    Cancelled { command: String },

    /// No pooled connection became available before the deadline.
    #[error("{0}")]
    PoolTimeout(&'static str),

    #[error("Cannot access a disposed object: {0}")]
    Disposed(&'static str),

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

impl ClientError {
    /// Returns true if the error leaves the owning connection in an unknown
    /// state, meaning it must be evicted instead of being reused.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectionClosed
                | ClientError::Protocol(_)
                | ClientError::CommandTimeout { .. }
                | ClientError::Cancelled { .. }
                | ClientError::NotConnected
                | ClientError::Handshake(_)
        )
    }

    /// Returns true for both command and pool timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::CommandTimeout { .. } | ClientError::PoolTimeout(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for ClientError {
    fn clone(&self) -> Self {
        match self {
            ClientError::Io(e) => ClientError::Io(Arc::clone(e)),
            ClientError::ConnectionClosed => ClientError::ConnectionClosed,
            ClientError::IncompleteData => ClientError::IncompleteData,
            ClientError::Protocol(s) => ClientError::Protocol(s.clone()),
            ClientError::Server(s) => ClientError::Server(s.clone()),
            ClientError::CommandTimeout {
                command,
                timeout_ms,
            } => ClientError::CommandTimeout {
                command: command.clone(),
                timeout_ms: *timeout_ms,
            },
            ClientError::Cancelled { command } => ClientError::Cancelled {
                command: command.clone(),
            },
            ClientError::PoolTimeout(s) => ClientError::PoolTimeout(s),
            ClientError::Disposed(s) => ClientError::Disposed(s),
            ClientError::NotConnected => ClientError::NotConnected,
            ClientError::Handshake(s) => ClientError::Handshake(s.clone()),
            ClientError::InvalidConfig(s) => ClientError::InvalidConfig(s.clone()),
            ClientError::UnexpectedResponse(s) => ClientError::UnexpectedResponse(s.clone()),
            ClientError::Cache(s) => ClientError::Cache(s.clone()),
        }
    }
}

impl PartialEq for ClientError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClientError::Io(e1), ClientError::Io(e2)) => e1.kind() == e2.kind(),
            (ClientError::Protocol(s1), ClientError::Protocol(s2)) => s1 == s2,
            (ClientError::Server(s1), ClientError::Server(s2)) => s1 == s2,
            (
                ClientError::CommandTimeout {
                    command: c1,
                    timeout_ms: t1,
                },
                ClientError::CommandTimeout {
                    command: c2,
                    timeout_ms: t2,
                },
            ) => c1 == c2 && t1 == t2,
            (ClientError::Cancelled { command: c1 }, ClientError::Cancelled { command: c2 }) => {
                c1 == c2
            }
            (ClientError::PoolTimeout(s1), ClientError::PoolTimeout(s2)) => s1 == s2,
            (ClientError::Disposed(s1), ClientError::Disposed(s2)) => s1 == s2,
            (ClientError::Handshake(s1), ClientError::Handshake(s2)) => s1 == s2,
            (ClientError::InvalidConfig(s1), ClientError::InvalidConfig(s2)) => s1 == s2,
            (ClientError::UnexpectedResponse(s1), ClientError::UnexpectedResponse(s2)) => {
                s1 == s2
            }
            (ClientError::Cache(s1), ClientError::Cache(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for ClientError {
    fn from(e: std::str::Utf8Error) -> Self {
        ClientError::Protocol(format!("invalid UTF-8 in reply: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for ClientError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        ClientError::Protocol(format!("invalid UTF-8 in reply: {e}"))
    }
}

impl From<ParseIntError> for ClientError {
    fn from(e: ParseIntError) -> Self {
        ClientError::Protocol(format!("invalid integer: {e}"))
    }
}

impl From<ParseFloatError> for ClientError {
    fn from(e: ParseFloatError) -> Self {
        ClientError::Protocol(format!("invalid double: {e}"))
    }
}
