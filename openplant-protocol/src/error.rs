//! Protocol error types and error kinds.

use crate::types::VarType;
use std::fmt;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding OpenPlant data.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    // Framing
    #[error("unknown compression mode: {0}")]
    UnknownCompression(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid magic: expected {expected:#010x}, got {actual:#010x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("decompression failed: {0}")]
    Decompress(String),

    // Codec
    #[error("incomplete input: need {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("unexpected marker {found:#04x}, expected {expected}")]
    UnexpectedMarker { expected: &'static str, found: u8 },

    #[error("unknown type tag: {0}")]
    UnknownType(u8),

    #[error("unsupported map key type: {0}")]
    UnsupportedKeyType(VarType),

    #[error("unexpected extension type {found}, expected {expected}")]
    UnexpectedExtension { expected: i8, found: i8 },

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    // Schema
    #[error("column index {index} out of range ({count} columns)")]
    ColumnOutOfRange { index: usize, count: usize },

    #[error("no column named {0:?}")]
    UnknownColumn(String),

    #[error("cannot convert {from} to {to}")]
    Coercion { from: VarType, to: VarType },

    #[error("table {0:?} already holds rows; schema is frozen")]
    SchemaFrozen(String),

    #[error("row {row} rejected after {errors} setter error(s)")]
    RowRejected { row: usize, errors: usize },

    #[error("row does not match schema of table {table:?}: {reason}")]
    RowSchemaMismatch { table: String, reason: String },

    #[error("missing required property: {0}")]
    MissingProperty(&'static str),
}

impl ProtocolError {
    /// Returns the error family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::UnknownCompression(_)
            | ProtocolError::FrameTooLarge { .. }
            | ProtocolError::ChecksumMismatch { .. }
            | ProtocolError::InvalidMagic { .. }
            | ProtocolError::Decompress(_) => ErrorKind::Framing,

            ProtocolError::Incomplete { .. }
            | ProtocolError::UnexpectedMarker { .. }
            | ProtocolError::UnknownType(_)
            | ProtocolError::UnsupportedKeyType(_)
            | ProtocolError::UnexpectedExtension { .. }
            | ProtocolError::InvalidUtf8
            | ProtocolError::Malformed { .. }
            | ProtocolError::MissingProperty(_) => ErrorKind::Codec,

            ProtocolError::ColumnOutOfRange { .. }
            | ProtocolError::UnknownColumn(_)
            | ProtocolError::Coercion { .. }
            | ProtocolError::SchemaFrozen(_)
            | ProtocolError::RowRejected { .. }
            | ProtocolError::RowSchemaMismatch { .. } => ErrorKind::Schema,
        }
    }

    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

/// Error families of the wire layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad magic, unknown compression, length or checksum mismatch.
    Framing,
    /// Malformed MessagePack, truncated payloads, bad nested values.
    Codec,
    /// Column index, type coercion and table state errors.
    Schema,
}

impl ErrorKind {
    /// Returns whether the connection that produced the error can be reused.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::Framing)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Framing => write!(f, "FRAMING"),
            ErrorKind::Codec => write!(f, "CODEC"),
            ErrorKind::Schema => write!(f, "SCHEMA"),
        }
    }
}
