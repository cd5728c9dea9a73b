//! Gateway side of one storlet execution
//!
//! The gateway allocates pipes for the input, the output body and the output
//! metadata, hands the remote ends to the daemon in one execute datagram and
//! keeps the local ends. Every wait on a local end is bounded by the storlet
//! timeout; when one expires the task is cancelled once before the timeout is
//! reported.

use crate::{
    errors::StorletError,
    request::{ByteStream, DataSource, StorletRequest},
};
use bytes::Bytes;
use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use serde_json::Value;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    os::unix::io::{AsRawFd, OwnedFd},
    path::{Path, PathBuf},
    time::Duration,
};
use storlets_protocol::{transport, FdType, Metadata, SBusClient, SBusFileDescriptor};
use tokio::{io::unix::AsyncFd, task, time};

const MAX_METADATA_SIZE: usize = 4096;
const CHUNK_SIZE: usize = 64 * 1024;

fn set_nonblocking<F: AsRawFd>(file: &F) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Local read end of a pipe, driven by readiness notifications
struct PipeReader(AsyncFd<File>);

impl PipeReader {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let file = File::from(fd);
        set_nonblocking(&file)?;
        Ok(PipeReader(AsyncFd::new(file)?))
    }

    /// Wait until a read would not block, without consuming anything
    async fn readable(&self) -> io::Result<()> {
        self.0.readable().await?;
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.0.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Local write end of an input pipe
struct PipeWriter(AsyncFd<File>);

impl PipeWriter {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let file = File::from(fd);
        set_nonblocking(&file)?;
        Ok(PipeWriter(AsyncFd::new(file)?))
    }

    async fn writable(&self) -> io::Result<()> {
        self.0.writable().await?;
        Ok(())
    }

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.0.writable().await?;
            let written = match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[written..];
        }
        Ok(())
    }
}

/// Pump one input stream into its pipe; failures end the stream early
async fn write_input(writer: PipeWriter, mut body: ByteStream, timeout: Duration) {
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                log::error!("failed to read storlet input: {}", err);
                return;
            }
        };
        match time::timeout(timeout, writer.write_all(&chunk)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("failed to write storlet input: {}", err);
                return;
            }
            Err(_) => {
                log::error!("timed out after {:?} writing storlet input", timeout);
                return;
            }
        }
    }
}

/// Handle to cancel a task the daemon has admitted
#[derive(Clone, Debug)]
pub struct TaskCanceller {
    pipe_path: PathBuf,
    task_id: String,
}

impl TaskCanceller {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(pipe_path: P, task_id: S) -> Self {
        TaskCanceller {
            pipe_path: pipe_path.into(),
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn cancel(&self) -> Result<(), StorletError> {
        let client = SBusClient::new(&self.pipe_path);
        let task_id = self.task_id.clone();
        let reply = task::spawn_blocking(move || client.cancel(&task_id)).await?;
        match reply {
            Ok(reply) if reply.status => Ok(()),
            Ok(reply) => Err(StorletError::runtime(format!(
                "Failed to cancel task: {}",
                reply.message
            ))),
            Err(err) => {
                log::debug!("cancel for task {} not delivered: {}", self.task_id, err);
                Err(StorletError::runtime("Failed to cancel task"))
            }
        }
    }

    async fn cancel_quietly(&self) {
        if let Err(err) = self.cancel().await {
            log::warn!(
                "task {} timed out, but failed to get cancelled: {}",
                self.task_id,
                err
            );
        }
    }
}

/// Output body of a running storlet
pub struct StorletOutputStream {
    reader: Option<PipeReader>,
    timeout: Duration,
    canceller: Option<TaskCanceller>,
}

impl StorletOutputStream {
    fn new(reader: PipeReader, timeout: Duration, canceller: Option<TaskCanceller>) -> Self {
        StorletOutputStream {
            reader: Some(reader),
            timeout,
            canceller,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.canceller.as_ref().map(TaskCanceller::task_id)
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Next chunk of at most 64 KiB, or `None` at the end of the output
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, StorletError> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let result = match &self.reader {
            Some(reader) => time::timeout(self.timeout, reader.read(&mut buf)).await,
            None => return Ok(None),
        };
        match result {
            Ok(Ok(0)) => {
                self.close();
                Ok(None)
            }
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(Some(Bytes::from(buf)))
            }
            Ok(Err(err)) => {
                self.close();
                Err(err.into())
            }
            Err(_) => {
                if let Some(canceller) = &self.canceller {
                    canceller.cancel_quietly().await;
                }
                self.close();
                Err(StorletError::Timeout(self.timeout))
            }
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, StorletError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Ask the daemon to stop producing this output
    pub async fn cancel(&self) -> Result<(), StorletError> {
        match &self.canceller {
            Some(canceller) => canceller.cancel().await,
            None => Ok(()),
        }
    }

    pub fn close(&mut self) {
        self.reader = None;
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, StorletError>> {
        stream::unfold(self, |mut output| async move {
            match output.read_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), output)),
                Ok(None) => None,
                Err(err) => Some((Err(err), output)),
            }
        })
        .boxed()
    }
}

/// Result of a successful invocation
pub struct StorletResponse {
    pub user_metadata: Metadata,
    pub body: StorletOutputStream,
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().append(true).create(true).open(path)
}

/// Read the whole metadata document, capped at [MAX_METADATA_SIZE]
async fn read_metadata(reader: &PipeReader) -> io::Result<Vec<u8>> {
    let mut body = vec![0u8; MAX_METADATA_SIZE];
    let mut filled = 0;
    while filled < body.len() {
        match reader.read(&mut body[filled..]).await? {
            0 => break,
            len => filled += len,
        }
    }
    body.truncate(filled);
    Ok(body)
}

/// Drives one request through a daemon channel
#[derive(Clone, Debug)]
pub struct StorletInvocationProtocol {
    pipe_path: PathBuf,
    log_path: PathBuf,
    timeout: Duration,
}

impl StorletInvocationProtocol {
    pub fn new<P: Into<PathBuf>, L: Into<PathBuf>>(
        pipe_path: P,
        log_path: L,
        timeout: Duration,
    ) -> Self {
        StorletInvocationProtocol {
            pipe_path: pipe_path.into(),
            log_path: log_path.into(),
            timeout,
        }
    }

    async fn cancel_on_timeout<T, F>(
        &self,
        canceller: &TaskCanceller,
        wait: F,
    ) -> Result<T, StorletError>
    where
        F: std::future::Future<Output = io::Result<T>>,
    {
        match time::timeout(self.timeout, wait).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                canceller.cancel_quietly().await;
                Err(StorletError::Timeout(self.timeout))
            }
        }
    }

    /// Run the request and return once output metadata and body are ready
    pub async fn communicate(
        &self,
        request: StorletRequest,
    ) -> Result<StorletResponse, StorletError> {
        let StorletRequest {
            params,
            data,
            extra_data,
            options,
            ..
        } = request;

        let mut extra_streams = Vec::new();
        for extra in extra_data {
            match extra.source {
                DataSource::Stream(body) => extra_streams.push((extra.user_metadata, body)),
                DataSource::Fd(_) => Err(StorletError::InvalidRequest(
                    "extra data sources must be streams".into(),
                ))?,
            }
        }

        // remote ends go into the datagram, local ends stay here
        let mut input_streams = Vec::new();
        let input_fd = match data.source {
            DataSource::Fd(fd) => fd,
            DataSource::Stream(body) => {
                let (read, write) = transport::pipe()?;
                input_streams.push((write, body));
                read
            }
        };
        let (data_read, data_write) = transport::pipe()?;
        let (metadata_read, metadata_write) = transport::pipe()?;
        let log_file = open_log(&self.log_path)?;

        let mut storlets_metadata = Metadata::new();
        if let Some((start, end)) = options.range {
            storlets_metadata.insert("start".into(), Value::String(start.to_string()));
            storlets_metadata.insert("end".into(), Value::String(end.to_string()));
        }
        let mut fds = vec![
            SBusFileDescriptor::new(FdType::InputObject, input_fd)
                .storlets_metadata(storlets_metadata)
                .storage_metadata(data.user_metadata),
            SBusFileDescriptor::new(FdType::OutputObject, data_write),
            SBusFileDescriptor::new(FdType::OutputObjectMetadata, metadata_write),
            SBusFileDescriptor::new(FdType::Logger, log_file.try_clone()?),
        ];
        for (user_metadata, body) in extra_streams {
            let (read, write) = transport::pipe()?;
            fds.push(
                SBusFileDescriptor::new(FdType::InputObject, read).storage_metadata(user_metadata),
            );
            input_streams.push((write, body));
        }

        // the client drops every remote end once the datagram is out
        let client = SBusClient::new(&self.pipe_path);
        let reply = task::spawn_blocking(move || client.execute(params, fds)).await?;
        drop(log_file);
        let reply = reply.map_err(|err| {
            log::error!("failed to send execute command: {}", err);
            StorletError::runtime("Failed to send execute command")
        })?;
        if !reply.status {
            log::error!("execute command refused: {}", reply.message);
            Err(StorletError::runtime("Failed to send execute command"))?
        }
        let task_id = reply
            .task_id
            .ok_or_else(|| StorletError::runtime("Missing task id"))?;
        log::debug!("storlet task {} admitted", task_id);
        let canceller = TaskCanceller::new(&self.pipe_path, task_id);

        // the worker may write output before it has read all input
        for (write, body) in input_streams {
            let writer = PipeWriter::new(write)?;
            self.cancel_on_timeout(&canceller, writer.writable()).await?;
            tokio::spawn(write_input(writer, body, self.timeout));
        }

        let metadata_reader = PipeReader::new(metadata_read)?;
        let raw = self
            .cancel_on_timeout(&canceller, read_metadata(&metadata_reader))
            .await?;
        drop(metadata_reader);
        let user_metadata: Metadata = serde_json::from_slice(&raw).map_err(|err| {
            log::error!("failed to load metadata from json: {}", err);
            StorletError::runtime("Got invalid format about metadata")
        })?;

        let data_reader = PipeReader::new(data_read)?;
        self.cancel_on_timeout(&canceller, data_reader.readable())
            .await?;

        Ok(StorletResponse {
            user_metadata,
            body: StorletOutputStream::new(data_reader, self.timeout, Some(canceller)),
        })
    }
}
