//! Errors raised inside the sandbox processes

use crate::process::Pid;
use storlets_protocol::{ClientError, ProtocolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// protocol error
    #[error("protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    /// failed to talk to another daemon
    #[error("client error: {0}")]
    ClientError(#[from] ClientError),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// not allowed to inspect or signal a process
    #[error("permission denied for process {0}")]
    ProcessPermission(Pid),

    /// unexpected error while inspecting or signalling a process
    #[error("unexpected error for process {pid}: {source}")]
    ProcessError { pid: Pid, source: std::io::Error },

    /// no account by this name
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    /// no launcher for this language
    #[error("unsupported daemon language {0:?}")]
    UnsupportedLanguage(String),

    /// a required command parameter was missing
    #[error("missing parameter {0:?}")]
    MissingParam(&'static str),

    /// a command parameter could not be parsed
    #[error("invalid parameter {name}: {value:?}")]
    InvalidParam { name: &'static str, value: String },

    /// storlet wrote its output metadata twice
    #[error("sending metadata twice is not allowed")]
    MetadataAlreadySent,

    /// storlet wrote body data before metadata
    #[error("body should be sent after metadata is sent")]
    MetadataNotSent,

    /// no built-in or executable storlet by this name
    #[error("storlet {0:?} is not found")]
    UnknownStorlet(String),

    /// storlet ran but reported a failure
    #[error("storlet failed: {0}")]
    StorletFailed(String),

    /// the daemon process failed to come up
    #[error("daemon for {0} did not start")]
    DaemonStartFailed(String),
}
