use crate::{
    errors::ProtocolError,
    types::{Command, FdType},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::Write,
    os::unix::io::{AsRawFd, OwnedFd, RawFd},
};

/// Free-form JSON object attached to an fd
pub type Metadata = Map<String, Value>;

/// Free-form JSON object carrying a command's parameters
pub type Params = Map<String, Value>;

/// One attached file descriptor with its role and metadata
#[derive(Debug)]
pub struct SBusFileDescriptor {
    pub fd_type: FdType,
    pub fd: OwnedFd,
    pub storlets_metadata: Metadata,
    pub storage_metadata: Metadata,
}

impl SBusFileDescriptor {
    pub fn new<F: Into<OwnedFd>>(fd_type: FdType, fd: F) -> Self {
        SBusFileDescriptor {
            fd_type,
            fd: fd.into(),
            storlets_metadata: Metadata::new(),
            storage_metadata: Metadata::new(),
        }
    }

    pub fn storlets_metadata(mut self, metadata: Metadata) -> Self {
        self.storlets_metadata = metadata;
        self
    }

    pub fn storage_metadata(mut self, metadata: Metadata) -> Self {
        self.storage_metadata = metadata;
        self
    }

    /// The `{"storlets": {"type": ..}, "storage": {..}}` object sent on the wire
    pub fn metadata(&self) -> Value {
        let mut storlets = self.storlets_metadata.clone();
        storlets.insert("type".into(), Value::from(self.fd_type.token()));
        let mut metadata = Map::new();
        metadata.insert("storlets".into(), Value::Object(storlets));
        metadata.insert(
            "storage".into(),
            Value::Object(self.storage_metadata.clone()),
        );
        Value::Object(metadata)
    }

    /// Rebuild a descriptor from a received fd and its wire metadata object
    pub fn from_metadata(fd: OwnedFd, metadata: Value) -> Result<Self, ProtocolError> {
        let mut metadata = match metadata {
            Value::Object(map) => map,
            other => Err(ProtocolError::MalformedMetadata(other.to_string()))?,
        };
        let mut storlets = match metadata.remove("storlets") {
            Some(Value::Object(map)) => map,
            _ => Err(ProtocolError::MalformedMetadata(
                "missing storlets section".into(),
            ))?,
        };
        let fd_type = match storlets.remove("type") {
            Some(Value::String(token)) => token.parse()?,
            _ => Err(ProtocolError::MalformedMetadata("missing fd type".into()))?,
        };
        let storage = match metadata.remove("storage") {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Metadata::new(),
            Some(other) => Err(ProtocolError::MalformedMetadata(other.to_string()))?,
        };
        Ok(SBusFileDescriptor {
            fd_type,
            fd,
            storlets_metadata: storlets,
            storage_metadata: storage,
        })
    }
}

/// Concrete kind of a datagram, chosen by its command name
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DatagramKind {
    /// A command whose only attachment is the reply channel
    Service,
    /// A storlet invocation with its input, output and logger fds
    Execute,
}

const SERVICE_FDS: &[FdType] = &[FdType::ServiceReply];
const EXECUTE_FDS: &[FdType] = &[
    FdType::ServiceReply,
    FdType::InputObject,
    FdType::OutputObject,
    FdType::OutputObjectMetadata,
    FdType::Logger,
];

impl DatagramKind {
    pub fn for_command(command: &str) -> Self {
        if command == Command::Execute.token() {
            DatagramKind::Execute
        } else {
            DatagramKind::Service
        }
    }

    /// The fd types every datagram of this kind starts with, in order
    pub fn required_fd_types(self) -> &'static [FdType] {
        match self {
            DatagramKind::Service => SERVICE_FDS,
            DatagramKind::Execute => EXECUTE_FDS,
        }
    }

    fn check(self, sfds: &[SBusFileDescriptor]) -> Result<(), ProtocolError> {
        let required = self.required_fd_types();
        let given: Vec<FdType> = sfds.iter().map(|sfd| sfd.fd_type).collect();
        if given.len() < required.len() || &given[..required.len()] != required {
            return Err(ProtocolError::FdTypeMismatch {
                given,
                required: required.to_vec(),
            });
        }
        // only execute may carry more inputs after its prefix
        let extra = given[required.len()..]
            .iter()
            .find(|fd_type| self != DatagramKind::Execute || **fd_type != FdType::InputObject);
        match extra {
            Some(extra) => Err(ProtocolError::UnexpectedExtraFd(*extra)),
            None => Ok(()),
        }
    }
}

/// The command/params/task-id blob
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// One transport message: a command, attached fds, params and task id
#[derive(Debug)]
pub struct Datagram {
    kind: DatagramKind,
    command: String,
    sfds: Vec<SBusFileDescriptor>,
    params: Params,
    task_id: Option<String>,
}

impl Datagram {
    /// Build a datagram, checking the fd types against what its command requires
    pub fn new<S: Into<String>>(
        command: S,
        sfds: Vec<SBusFileDescriptor>,
        params: Params,
        task_id: Option<String>,
    ) -> Result<Self, ProtocolError> {
        let command = command.into();
        let kind = DatagramKind::for_command(&command);
        kind.check(&sfds)?;
        Ok(Datagram {
            kind,
            command,
            sfds,
            params,
            task_id,
        })
    }

    /// Rebuild a received datagram from its fds and decoded blobs
    pub fn from_wire(
        fds: Vec<OwnedFd>,
        metadata: Vec<Value>,
        cmd_params: CommandParams,
    ) -> Result<Self, ProtocolError> {
        if fds.len() != metadata.len() {
            Err(ProtocolError::MetadataCountMismatch {
                fds: fds.len(),
                metadata: metadata.len(),
            })?
        }
        let sfds = fds
            .into_iter()
            .zip(metadata.into_iter())
            .map(|(fd, metadata)| SBusFileDescriptor::from_metadata(fd, metadata))
            .collect::<Result<Vec<_>, _>>()?;
        Datagram::new(
            cmd_params.command,
            sfds,
            cmd_params.params,
            cmd_params.task_id,
        )
    }

    pub fn kind(&self) -> DatagramKind {
        self.kind
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn sfds(&self) -> &[SBusFileDescriptor] {
        &self.sfds
    }

    pub fn fd_types(&self) -> Vec<FdType> {
        self.sfds.iter().map(|sfd| sfd.fd_type).collect()
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.sfds.iter().map(|sfd| sfd.fd.as_raw_fd()).collect()
    }

    /// Per-fd metadata list, aligned with the fds
    pub fn metadata(&self) -> Vec<Value> {
        self.sfds.iter().map(SBusFileDescriptor::metadata).collect()
    }

    pub fn cmd_params(&self) -> CommandParams {
        CommandParams {
            command: self.command.clone(),
            params: self.params.clone(),
            task_id: self.task_id.clone(),
        }
    }

    /// Storage metadata of every input object, in order
    pub fn object_in_metadata(&self) -> Vec<&Metadata> {
        self.sfds
            .iter()
            .filter(|sfd| sfd.fd_type == FdType::InputObject)
            .map(|sfd| &sfd.storage_metadata)
            .collect()
    }

    /// Split off the reply channel, leaving the rest of the request
    pub fn into_request(self) -> (ReplyChannel, Request) {
        let mut sfds = self.sfds;
        // every kind starts with the reply fd, checked at construction
        let reply = ReplyChannel::new(sfds.remove(0).fd);
        let request = Request {
            command: self.command,
            params: self.params,
            task_id: self.task_id,
            sfds,
        };
        (reply, request)
    }
}

/// A received datagram without its reply channel
#[derive(Debug)]
pub struct Request {
    pub command: String,
    pub params: Params,
    pub task_id: Option<String>,
    pub sfds: Vec<SBusFileDescriptor>,
}

impl Request {
    /// Remove every fd of the given type, keeping their order
    pub fn take(&mut self, fd_type: FdType) -> Vec<SBusFileDescriptor> {
        let (taken, kept) = self
            .sfds
            .drain(..)
            .partition(|sfd| sfd.fd_type == fd_type);
        self.sfds = kept;
        taken
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Body written to a service reply fd
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceReply {
    pub status: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl ServiceReply {
    pub fn success<S: Into<String>>(message: S) -> Self {
        ServiceReply {
            status: true,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn failure<S: Into<String>>(message: S) -> Self {
        ServiceReply {
            status: false,
            message: message.into(),
            task_id: None,
        }
    }
}

/// Write end of a caller's reply pipe; closed once the reply is sent
#[derive(Debug)]
pub struct ReplyChannel {
    file: File,
}

impl ReplyChannel {
    pub fn new(fd: OwnedFd) -> Self {
        ReplyChannel {
            file: File::from(fd),
        }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.file.into()
    }

    pub fn send(mut self, reply: &ServiceReply) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(reply)?;
        self.file.write_all(&body)?;
        Ok(())
    }
}
