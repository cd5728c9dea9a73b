//! Blocking client for daemon and daemon factory channels

use crate::{
    errors::ClientError,
    messages::{Datagram, Params, SBusFileDescriptor, ServiceReply},
    transport,
    types::{Command, FdType},
};
use serde_json::Value;
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

/// Everything a daemon factory needs to launch one storlet daemon
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DaemonSpec {
    pub language: String,
    pub language_version: Option<String>,
    pub storlet_path: String,
    pub storlet_name: String,
    pub uds_path: String,
    pub log_level: String,
    pub pool_size: u32,
}

impl DaemonSpec {
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("daemon_language".into(), self.language.clone().into());
        params.insert("storlet_path".into(), self.storlet_path.clone().into());
        params.insert("storlet_name".into(), self.storlet_name.clone().into());
        params.insert("uds_path".into(), self.uds_path.clone().into());
        params.insert("log_level".into(), self.log_level.clone().into());
        params.insert("pool_size".into(), self.pool_size.into());
        if let Some(version) = &self.language_version {
            params.insert("daemon_language_version".into(), version.clone().into());
        }
        params
    }
}

#[derive(Clone, Debug)]
pub struct SBusClient {
    path: PathBuf,
}

impl SBusClient {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SBusClient {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a command and block until the server closes the reply pipe
    pub fn request(
        &self,
        command: Command,
        params: Params,
        task_id: Option<String>,
        extra_fds: Vec<SBusFileDescriptor>,
    ) -> Result<ServiceReply, ClientError> {
        let (read_fd, write_fd) = transport::pipe()?;
        {
            let mut sfds = Vec::with_capacity(extra_fds.len() + 1);
            sfds.push(SBusFileDescriptor::new(FdType::ServiceReply, write_fd));
            sfds.extend(extra_fds);
            let datagram = Datagram::new(command.token(), sfds, params, task_id)?;
            transport::send(&self.path, &datagram).map_err(|source| ClientError::SendFailed {
                command,
                path: self.path.clone(),
                source,
            })?;
            // dropping the datagram closes our copies of every fd it carried,
            // including the reply write end, so EOF arrives once the server is done
        }

        let mut body = Vec::new();
        File::from(read_fd).read_to_end(&mut body)?;
        parse_reply(&body)
    }

    pub fn ping(&self) -> Result<ServiceReply, ClientError> {
        self.request(Command::Ping, Params::new(), None, Vec::new())
    }

    pub fn halt(&self) -> Result<ServiceReply, ClientError> {
        self.request(Command::Halt, Params::new(), None, Vec::new())
    }

    pub fn execute(
        &self,
        params: Params,
        invocation_fds: Vec<SBusFileDescriptor>,
    ) -> Result<ServiceReply, ClientError> {
        self.request(Command::Execute, params, None, invocation_fds)
    }

    pub fn start_daemon(&self, spec: &DaemonSpec) -> Result<ServiceReply, ClientError> {
        self.request(Command::StartDaemon, spec.to_params(), None, Vec::new())
    }

    pub fn stop_daemon(&self, storlet_name: &str) -> Result<ServiceReply, ClientError> {
        self.request(
            Command::StopDaemon,
            storlet_name_params(storlet_name),
            None,
            Vec::new(),
        )
    }

    pub fn stop_daemons(&self) -> Result<ServiceReply, ClientError> {
        self.request(Command::StopDaemons, Params::new(), None, Vec::new())
    }

    pub fn daemon_status(&self, storlet_name: &str) -> Result<ServiceReply, ClientError> {
        self.request(
            Command::DaemonStatus,
            storlet_name_params(storlet_name),
            None,
            Vec::new(),
        )
    }

    pub fn cancel(&self, task_id: &str) -> Result<ServiceReply, ClientError> {
        self.request(
            Command::Cancel,
            Params::new(),
            Some(task_id.to_string()),
            Vec::new(),
        )
    }
}

fn storlet_name_params(storlet_name: &str) -> Params {
    let mut params = Params::new();
    params.insert("storlet_name".into(), Value::from(storlet_name));
    params
}

/// Parse a reply body, which must carry a boolean status and a string message
pub fn parse_reply(body: &[u8]) -> Result<ServiceReply, ClientError> {
    serde_json::from_slice(body)
        .map_err(|_| ClientError::InvalidReply(String::from_utf8_lossy(body).into_owned()))
}
