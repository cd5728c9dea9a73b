#![allow(dead_code)]

use serde_json::{json, Value};
use std::{
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::{fs::PermissionsExt, io::OwnedFd},
    path::{Path, PathBuf},
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};
use storlets_protocol::{
    transport, FdType, Metadata, Params, SBusClient, SBusFileDescriptor, ServiceReply,
};

pub const DAEMON: &str = env!("CARGO_BIN_EXE_storlets-daemon");
pub const FACTORY: &str = env!("CARGO_BIN_EXE_storlets-daemon-factory");

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

/// Ping until the channel answers, panicking after a few seconds
pub fn wait_for_channel(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let client = SBusClient::new(path);
    while Instant::now() < deadline {
        if let Ok(reply) = client.ping() {
            if reply.status {
                return;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("channel {:?} never answered", path);
}

pub fn spawn_daemon(dir: &Path, storlet: &str, pool_size: usize) -> (Child, PathBuf) {
    let path = dir.join(storlet);
    let child = Command::new(DAEMON)
        .arg(storlet)
        .arg(&path)
        .arg("DEBUG")
        .arg(pool_size.to_string())
        .arg("test_container")
        .spawn()
        .unwrap();
    wait_for_channel(&path);
    (child, path)
}

/// A daemon for an executable storlet found under `storlet_path`
pub fn spawn_exec_daemon(dir: &Path, storlet: &str, storlet_path: &Path) -> (Child, PathBuf) {
    let path = dir.join(storlet);
    let child = Command::new(DAEMON)
        .arg(storlet)
        .arg(&path)
        .arg("DEBUG")
        .arg("2")
        .arg("test_container")
        .arg("--storlet-path")
        .arg(storlet_path)
        .spawn()
        .unwrap();
    wait_for_channel(&path);
    (child, path)
}

pub fn spawn_factory(dir: &Path) -> (Child, PathBuf) {
    let path = dir.join("factory_pipe");
    let child = Command::new(FACTORY)
        .arg(&path)
        .arg("DEBUG")
        .arg("test_container")
        .arg("--native-daemon")
        .arg(DAEMON)
        .spawn()
        .unwrap();
    wait_for_channel(&path);
    (child, path)
}

/// Executable shell script `dir/name` running `body`
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Seekable input file holding `body`
pub fn input_file(dir: &Path, body: &[u8]) -> OwnedFd {
    let mut file = tempfile::tempfile_in(dir).unwrap();
    file.write_all(body).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.into()
}

/// Local ends of one execute request
pub struct Invocation {
    pub reply: ServiceReply,
    pub metadata: File,
    pub data: File,
    pub log: File,
}

impl Invocation {
    pub fn read_metadata(&mut self) -> Option<Metadata> {
        let mut body = Vec::new();
        self.metadata.read_to_end(&mut body).unwrap();
        if body.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&body).unwrap())
        }
    }

    pub fn read_data(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        self.data.read_to_end(&mut body).unwrap();
        body
    }

    pub fn read_log(&mut self) -> String {
        let mut text = String::new();
        self.log.seek(SeekFrom::Start(0)).unwrap();
        self.log.read_to_string(&mut text).unwrap();
        text
    }
}

pub fn execute(
    path: &Path,
    dir: &Path,
    input: OwnedFd,
    storlets_metadata: Metadata,
    params: Params,
) -> Invocation {
    let (metadata_read, metadata_write) = transport::pipe().unwrap();
    let (data_read, data_write) = transport::pipe().unwrap();
    let log = tempfile::tempfile_in(dir).unwrap();

    let mut storage = Metadata::new();
    storage.insert("Content-Type".into(), json!("application/octet-stream"));
    let fds = vec![
        SBusFileDescriptor::new(FdType::InputObject, input)
            .storlets_metadata(storlets_metadata)
            .storage_metadata(storage),
        SBusFileDescriptor::new(FdType::OutputObject, data_write),
        SBusFileDescriptor::new(FdType::OutputObjectMetadata, metadata_write),
        SBusFileDescriptor::new(FdType::Logger, log.try_clone().unwrap()),
    ];
    let reply = SBusClient::new(path).execute(params, fds).unwrap();
    Invocation {
        reply,
        metadata: File::from(metadata_read),
        data: File::from(data_read),
        log,
    }
}
