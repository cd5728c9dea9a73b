//! What the storage side hands over for one storlet invocation

use crate::errors::StorletError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::{collections::BTreeMap, io, os::unix::io::OwnedFd, sync::Arc, time::SystemTime};
use storlets_protocol::{Metadata, Params};

/// Object bytes flowing between storage and the gateway
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

pub fn byte_stream<B: Into<Bytes>>(body: B) -> ByteStream {
    stream::once(futures_util::future::ready(Ok(body.into()))).boxed()
}

/// Where input bytes come from
pub enum DataSource {
    /// Already backed by a descriptor, handed to the daemon as is
    Fd(OwnedFd),
    /// Pumped into a pipe by the gateway while the storlet runs
    Stream(ByteStream),
}

/// One input object with its user metadata
pub struct StorletData {
    pub user_metadata: Metadata,
    pub source: DataSource,
}

impl StorletData {
    pub fn from_fd(user_metadata: Metadata, fd: OwnedFd) -> Self {
        StorletData {
            user_metadata,
            source: DataSource::Fd(fd),
        }
    }

    pub fn from_stream(user_metadata: Metadata, stream: ByteStream) -> Self {
        StorletData {
            user_metadata,
            source: DataSource::Stream(stream),
        }
    }

    pub fn has_fd(&self) -> bool {
        match self.source {
            DataSource::Fd(_) => true,
            DataSource::Stream(_) => false,
        }
    }
}

/// A storlet or dependency file fetched from storage
pub struct FetchedObject {
    pub body: ByteStream,
    /// Octal permission string recorded with the object, if any
    pub permissions: Option<String>,
}

/// Access to the storage that holds storlet code and receives execution logs
#[async_trait]
pub trait FileManager: Send + Sync {
    async fn get_storlet(&self, name: &str) -> Result<FetchedObject, StorletError>;

    async fn get_dependency(&self, name: &str) -> Result<FetchedObject, StorletError>;

    async fn put_log(&self, name: &str, body: Bytes) -> Result<(), StorletError>;
}

/// Size and modification time the storage reports for the storlet object
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeclaredAttributes {
    pub size: u64,
    pub timestamp: SystemTime,
}

pub struct RequestOptions {
    /// Class or module the daemon runs; daemons are keyed by it
    pub storlet_main: String,
    pub storlet_language: String,
    pub storlet_language_version: Option<String>,
    pub dependencies: Vec<String>,
    pub file_manager: Arc<dyn FileManager>,
    pub generate_log: bool,
    /// Half-open byte range of the input to process
    pub range: Option<(u64, u64)>,
    pub storlet_attributes: Option<DeclaredAttributes>,
}

fn invalid(key: &str, value: &str) -> StorletError {
    StorletError::InvalidRequest(format!("invalid value for {}: {:?}", key, value))
}

fn required(options: &BTreeMap<String, String>, key: &str) -> Result<String, StorletError> {
    options
        .get(key)
        .cloned()
        .ok_or_else(|| StorletError::InvalidRequest(format!("required option {} is missing", key)))
}

fn optional_u64(options: &BTreeMap<String, String>, key: &str) -> Result<Option<u64>, StorletError> {
    options
        .get(key)
        .map(|value| value.trim().parse().map_err(|_| invalid(key, value)))
        .transpose()
}

impl RequestOptions {
    pub fn new<M: Into<String>, L: Into<String>>(
        storlet_main: M,
        storlet_language: L,
        file_manager: Arc<dyn FileManager>,
    ) -> Self {
        RequestOptions {
            storlet_main: storlet_main.into(),
            storlet_language: storlet_language.into(),
            storlet_language_version: None,
            dependencies: Vec::new(),
            file_manager,
            generate_log: false,
            range: None,
            storlet_attributes: None,
        }
    }

    /// Options in the string form the storage middleware produces
    pub fn from_map(
        options: &BTreeMap<String, String>,
        file_manager: Arc<dyn FileManager>,
    ) -> Result<Self, StorletError> {
        let mut result = RequestOptions::new(
            required(options, "storlet_main")?,
            required(options, "storlet_language")?,
            file_manager,
        );
        result.storlet_language_version = options.get("storlet_language_version").cloned();
        result.dependencies = options
            .get("storlet_dependency")
            .map(|deps| {
                deps.split(',')
                    .map(str::trim)
                    .filter(|dep| !dep.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        result.generate_log = options
            .get("generate_log")
            .map(|value| matches!(value.to_lowercase().as_str(), "true" | "yes" | "1"))
            .unwrap_or(false);

        let start = optional_u64(options, "range_start")?;
        let end = optional_u64(options, "range_end")?;
        result.range = match (start, end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };

        let size = options
            .get("storlet_content_length")
            .map(|value| {
                value
                    .trim()
                    .trim_end_matches('L')
                    .parse::<u64>()
                    .map_err(|_| invalid("storlet_content_length", value))
            })
            .transpose()?;
        let timestamp = options
            .get("storlet_x_timestamp")
            .map(|value| {
                value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(|secs| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs_f64(secs))
                    .ok_or_else(|| invalid("storlet_x_timestamp", value))
            })
            .transpose()?;
        result.storlet_attributes = match (size, timestamp) {
            (Some(size), Some(timestamp)) => Some(DeclaredAttributes { size, timestamp }),
            _ => None,
        };
        Ok(result)
    }
}

pub struct StorletRequest {
    /// Name of the storlet object, e.g. `identity-1.0.jar`
    pub storlet_id: String,
    pub params: Params,
    pub data: StorletData,
    pub extra_data: Vec<StorletData>,
    pub options: RequestOptions,
}

impl StorletRequest {
    pub fn new<S: Into<String>>(
        storlet_id: S,
        params: Params,
        data: StorletData,
        options: RequestOptions,
    ) -> Self {
        StorletRequest {
            storlet_id: storlet_id.into(),
            params,
            data,
            extra_data: Vec::new(),
            options,
        }
    }

    pub fn extra_data(mut self, data: StorletData) -> Self {
        self.extra_data.push(data);
        self
    }
}
