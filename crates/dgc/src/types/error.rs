//! DGC error types

use thiserror::Error;

use super::ObjectId;

/// Result type for DGC operations
pub type Result<T> = std::result::Result<T, DgcError>;

/// Kinds of fault a DGC endpoint may report back to its caller.
///
/// This is a closed set: a response carrying any other kind is rejected
/// at the framing boundary like any other disallowed type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FaultKind {
    /// The request did not pass the wire allow-list
    ProtocolViolation = 1,
    /// The operation number is not a DGC operation
    UnknownOperation = 2,
    /// The server failed while handling a well-formed request
    ServerError = 3,
    /// The server is shutting down and refuses new leases
    ShuttingDown = 4,
}

impl FaultKind {
    /// Decode a fault kind from its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ProtocolViolation),
            2 => Some(Self::UnknownOperation),
            3 => Some(Self::ServerError),
            4 => Some(Self::ShuttingDown),
            _ => None,
        }
    }
}

/// DGC-specific errors
#[derive(Error, Debug)]
pub enum DgcError {
    /// IO error on the underlying channel
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Incoming message failed the type allow-list or was malformed
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Buffer underflow (not enough data)
    #[error("buffer underflow: need {needed} bytes, have {have}")]
    BufferUnderflow { needed: usize, have: usize },

    /// The peer answered with a fault
    #[error("remote fault {kind:?}: {message}")]
    RemoteFault { kind: FaultKind, message: String },

    /// No exported object with this identifier
    #[error("no such object: {0}")]
    NoSuchObject(ObjectId),

    /// The object (or identifier) is already exported
    #[error("object already exported: {0}")]
    AlreadyExported(ObjectId),

    /// Connection closed by the peer
    #[error("connection closed")]
    ConnectionClosed,

    /// Response did not match the outstanding call
    #[error("call ID mismatch: expected {expected}, got {got}")]
    CallIdMismatch { expected: u32, got: u32 },

    /// Frame exceeds the transport limit
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The runtime has been shut down
    #[error("DGC runtime shut down")]
    Shutdown,
}

impl DgcError {
    /// Shorthand for a protocol violation
    pub fn violation(message: impl Into<String>) -> Self {
        DgcError::ProtocolViolation(message.into())
    }
}
