//! Client error types.

use crate::config::ConfigError;
use openplant_protocol::error::ErrorKind as ProtocolErrorKind;
use openplant_protocol::ProtocolError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("connection is broken; reconnect before reuse")]
    Broken,

    #[error("login refused by server (code {code})")]
    Auth { code: i32 },

    #[error("server error: {errno} - {message}")]
    Server { errno: i32, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Error family of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Framing,
    Codec,
    Schema,
    /// Non-zero `Errno` from the server.
    Protocol,
    Auth,
    Usage,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Io(_)
            | ClientError::NotConnected
            | ClientError::ConnectionClosed
            | ClientError::Timeout
            | ClientError::Broken => ErrorKind::Transport,
            ClientError::Protocol(e) => match e.kind() {
                ProtocolErrorKind::Framing => ErrorKind::Framing,
                ProtocolErrorKind::Codec => ErrorKind::Codec,
                ProtocolErrorKind::Schema => ErrorKind::Schema,
            },
            ClientError::Server { .. } => ErrorKind::Protocol,
            ClientError::Auth { .. } => ErrorKind::Auth,
            ClientError::InvalidArgument(_)
            | ClientError::SubscriptionClosed
            | ClientError::Config(_) => ErrorKind::Usage,
        }
    }

    /// Returns whether the connection that produced this error must be
    /// discarded (or reconnected) before reuse.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Framing)
    }

    /// Returns whether retrying on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_)
            | ClientError::Timeout
            | ClientError::ConnectionClosed
            | ClientError::Broken => true,
            ClientError::Protocol(e) => e.kind() == ProtocolErrorKind::Framing,
            _ => false,
        }
    }
}
