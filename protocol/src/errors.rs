//! Errors from building, moving or answering datagrams

use crate::types::FdType;
use thiserror::Error;

/// Errors in the datagram model or on the wire
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// io error on the channel socket
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// json error in the metadata or params blob
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// the fd types do not start with the sequence this datagram kind requires
    #[error("fd type mismatch, given {given:?}, required {required:?}")]
    FdTypeMismatch {
        given: Vec<FdType>,
        required: Vec<FdType>,
    },

    /// an fd beyond the required ones, other than an execute datagram's extra inputs
    #[error("unexpected extra fd of type {0}")]
    UnexpectedExtraFd(FdType),

    /// unrecognized fd type token
    #[error("unknown fd type {0:?}")]
    UnknownFdType(String),

    /// unrecognized command token
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// per-fd metadata is missing the storlets section or its type
    #[error("malformed fd metadata: {0}")]
    MalformedMetadata(String),

    /// metadata list is not aligned with the attached fds
    #[error("{fds} fds were attached but {metadata} metadata entries were sent")]
    MetadataCountMismatch { fds: usize, metadata: usize },

    /// the header announced a different number of fds than were received
    #[error("header announced {expected} fds but {received} were received")]
    FdCountMismatch { expected: usize, received: usize },

    /// payload is shorter than its header claims
    #[error("truncated message")]
    Truncated,

    /// payload or fd list exceeds what a single datagram can carry
    #[error("message too large")]
    MessageTooLarge,

    /// sender reached a channel path that is not a unix socket address
    #[error("invalid channel path {0:?}")]
    InvalidPath(std::path::PathBuf),
}

/// Errors seen by a client waiting for a service reply
#[derive(Error, Debug)]
pub enum ClientError {
    /// protocol error
    #[error("protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    /// io error while reading the reply
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// the datagram could not be delivered to the channel
    #[error("failed to send {command} to {path:?}: {source}")]
    SendFailed {
        command: crate::types::Command,
        path: std::path::PathBuf,
        source: ProtocolError,
    },

    /// reply was not a valid service reply body
    #[error("invalid service reply {0:?}")]
    InvalidReply(String),
}
