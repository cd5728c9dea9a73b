//! File wrappers handed to a storlet for one invocation

use crate::errors::SandError;
use serde_json::Value;
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Take, Write},
    os::unix::io::OwnedFd,
};
use storlets_protocol::{Metadata, SBusFileDescriptor};

enum InputBody {
    Whole(File),
    Range(Take<File>),
}

/// Object data coming in, with its storage metadata
pub struct StorletInputFile {
    metadata: Metadata,
    body: InputBody,
}

fn range_bound(metadata: &Metadata, key: &'static str) -> Result<Option<u64>, SandError> {
    match metadata.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| SandError::InvalidParam {
                name: key,
                value: n.to_string(),
            }),
        Some(Value::String(s)) => s.parse().map(Some).map_err(|_| SandError::InvalidParam {
            name: key,
            value: s.clone(),
        }),
        Some(other) => Err(SandError::InvalidParam {
            name: key,
            value: other.to_string(),
        }),
    }
}

impl StorletInputFile {
    pub fn new(metadata: Metadata, fd: OwnedFd) -> Self {
        StorletInputFile {
            metadata,
            body: InputBody::Whole(File::from(fd)),
        }
    }

    /// Input limited to the bytes `start..end` of a seekable fd
    pub fn range(metadata: Metadata, fd: OwnedFd, start: u64, end: u64) -> io::Result<Self> {
        let mut file = File::from(fd);
        file.seek(SeekFrom::Start(start))?;
        Ok(StorletInputFile {
            metadata,
            body: InputBody::Range(file.take(end.saturating_sub(start))),
        })
    }

    /// Wrap a received input fd, honouring `start` and `end` when both are set
    pub fn from_sfd(sfd: SBusFileDescriptor) -> Result<Self, SandError> {
        let start = range_bound(&sfd.storlets_metadata, "start")?;
        let end = range_bound(&sfd.storlets_metadata, "end")?;
        Ok(match (start, end) {
            (Some(start), Some(end)) => {
                StorletInputFile::range(sfd.storage_metadata, sfd.fd, start, end)?
            }
            _ => StorletInputFile::new(sfd.storage_metadata, sfd.fd),
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Read for StorletInputFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.body {
            InputBody::Whole(file) => file.read(buf),
            InputBody::Range(file) => file.read(buf),
        }
    }
}

/// Object data going out; metadata must be set once, before any body bytes
pub struct StorletOutputFile {
    metadata_file: Option<File>,
    metadata: Option<Metadata>,
    body: File,
}

impl StorletOutputFile {
    pub fn new(metadata_fd: OwnedFd, body_fd: OwnedFd) -> Self {
        StorletOutputFile {
            metadata_file: Some(File::from(metadata_fd)),
            metadata: None,
            body: File::from(body_fd),
        }
    }

    /// Write the metadata and close its fd, which lets the reader move on
    pub fn set_metadata(&mut self, metadata: Metadata) -> Result<(), SandError> {
        let mut file = self
            .metadata_file
            .take()
            .ok_or(SandError::MetadataAlreadySent)?;
        file.write_all(&serde_json::to_vec(&metadata)?)?;
        self.metadata = Some(metadata);
        Ok(())
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Body fd, for storlets that hand it to a subprocess
    pub fn body_fd(&mut self) -> Result<OwnedFd, SandError> {
        if self.metadata_file.is_some() {
            Err(SandError::MetadataNotSent)?
        }
        Ok(self.body.try_clone()?.into())
    }
}

impl Write for StorletOutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.metadata_file.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                SandError::MetadataNotSent,
            ));
        }
        self.body.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.body.flush()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Per-invocation log that ends up next to the object in the gateway
pub struct StorletLogger {
    storlet_name: String,
    file: File,
}

impl StorletLogger {
    pub fn new<S: Into<String>>(storlet_name: S, fd: OwnedFd) -> Self {
        StorletLogger {
            storlet_name: storlet_name.into(),
            file: File::from(fd),
        }
    }

    pub fn emit(&mut self, level: LogLevel, message: &str) {
        let line = format!("{} {}: {}\n", self.storlet_name, level.as_str(), message);
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            log::warn!("failed to write storlet log: {}", err);
        }
    }

    pub fn debug(&mut self, message: &str) {
        self.emit(LogLevel::Debug, message)
    }

    pub fn info(&mut self, message: &str) {
        self.emit(LogLevel::Info, message)
    }

    pub fn warn(&mut self, message: &str) {
        self.emit(LogLevel::Warn, message)
    }

    pub fn error(&mut self, message: &str) {
        self.emit(LogLevel::Error, message)
    }

    /// Logger fd, for storlets that hand it to a subprocess
    pub fn fd(&self) -> io::Result<OwnedFd> {
        Ok(self.file.try_clone()?.into())
    }
}
