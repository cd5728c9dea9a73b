use crate::errors::ProtocolError;
use std::{fmt, str::FromStr};

/// Largest payload (header, metadata and params) carried by one datagram
pub const MAX_MSG_LENGTH: usize = 4096;

/// Largest number of file descriptors carried by one datagram
pub const MAX_FDS: usize = 4096;

/// Role of a file descriptor attached to a datagram
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FdType {
    InputObject,
    OutputObject,
    OutputObjectMetadata,
    Logger,
    ServiceReply,
    TaskIdReply,
}

impl FdType {
    pub fn token(self) -> &'static str {
        match self {
            FdType::InputObject => "SBUS_FD_INPUT_OBJECT",
            FdType::OutputObject => "SBUS_FD_OUTPUT_OBJECT",
            FdType::OutputObjectMetadata => "SBUS_FD_OUTPUT_OBJECT_METADATA",
            FdType::Logger => "SBUS_FD_LOGGER",
            FdType::ServiceReply => "SBUS_FD_SERVICE_OUT",
            FdType::TaskIdReply => "SBUS_FD_OUTPUT_TASK_ID",
        }
    }
}

impl fmt::Display for FdType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for FdType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SBUS_FD_INPUT_OBJECT" => FdType::InputObject,
            "SBUS_FD_OUTPUT_OBJECT" => FdType::OutputObject,
            "SBUS_FD_OUTPUT_OBJECT_METADATA" => FdType::OutputObjectMetadata,
            "SBUS_FD_LOGGER" => FdType::Logger,
            "SBUS_FD_SERVICE_OUT" => FdType::ServiceReply,
            "SBUS_FD_OUTPUT_TASK_ID" => FdType::TaskIdReply,
            other => Err(ProtocolError::UnknownFdType(other.to_string()))?,
        })
    }
}

/// Every command understood by a daemon or daemon factory
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Command {
    Halt,
    Execute,
    StartDaemon,
    StopDaemon,
    StopDaemons,
    DaemonStatus,
    Ping,
    Cancel,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Halt,
        Command::Execute,
        Command::StartDaemon,
        Command::StopDaemon,
        Command::StopDaemons,
        Command::DaemonStatus,
        Command::Ping,
        Command::Cancel,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Command::Halt => "SBUS_CMD_HALT",
            Command::Execute => "SBUS_CMD_EXECUTE",
            Command::StartDaemon => "SBUS_CMD_START_DAEMON",
            Command::StopDaemon => "SBUS_CMD_STOP_DAEMON",
            Command::StopDaemons => "SBUS_CMD_STOP_DAEMONS",
            Command::DaemonStatus => "SBUS_CMD_DAEMON_STATUS",
            Command::Ping => "SBUS_CMD_PING",
            Command::Cancel => "SBUS_CMD_CANCEL",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|command| command.token() == s)
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}
