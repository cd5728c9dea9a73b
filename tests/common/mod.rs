#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use storlets::{
    engine::{ContainerEngine, ContainerSpec},
    errors::{EngineError, StorletError},
    request::{byte_stream, FetchedObject},
    FileManager,
};
use storlets_protocol::{Command, FdType, Readiness, Request, SBus, SBusClient, ServiceReply};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A stand-in for a daemon or factory, answering from a closure on its own thread
pub struct FakeServer {
    path: PathBuf,
    handle: Option<thread::JoinHandle<Vec<String>>>,
}

impl FakeServer {
    /// Serve until `halt`, recording every command token received
    pub fn spawn<F>(path: &Path, mut handler: F) -> FakeServer
    where
        F: FnMut(Command, Request) -> ServiceReply + Send + 'static,
    {
        let sbus = SBus::create(path).unwrap();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match sbus.listen(Some(Duration::from_secs(30))) {
                    Ok(Readiness::Ready) => {}
                    _ => break,
                }
                let datagram = match sbus.receive() {
                    Ok(datagram) => datagram,
                    Err(_) => continue,
                };
                let (reply, request) = datagram.into_request();
                seen.push(request.command.clone());
                let command: Command = match request.command.parse() {
                    Ok(command) => command,
                    Err(_) => {
                        let _ = reply.send(&ServiceReply::failure("unknown"));
                        continue;
                    }
                };
                if command == Command::Halt {
                    let _ = reply.send(&ServiceReply::success("OK"));
                    break;
                }
                let _ = reply.send(&handler(command, request));
            }
            seen
        });
        FakeServer {
            path: path.to_path_buf(),
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the server and return the command tokens it saw, halt included
    pub fn halt(mut self) -> Vec<String> {
        SBusClient::new(&self.path).halt().unwrap();
        self.handle.take().unwrap().join().unwrap()
    }
}

pub fn with_task_id(task_id: &str) -> ServiceReply {
    let mut reply = ServiceReply::success("Successfully invoked storlet");
    reply.task_id = Some(task_id.to_string());
    reply
}

/// A daemon whose storlet echoes its inputs after mirroring the first input's metadata
pub fn echo_daemon(path: &Path) -> FakeServer {
    FakeServer::spawn(path, |command, mut request| match command {
        Command::Execute => {
            let inputs = request.take(FdType::InputObject);
            let body = request.take(FdType::OutputObject).remove(0);
            let metadata = request.take(FdType::OutputObjectMetadata).remove(0);
            let logger = request.take(FdType::Logger).remove(0);
            thread::spawn(move || {
                let mut log = File::from(logger.fd);
                let _ = writeln!(log, "echo INFO: started");
                let mut md = File::from(metadata.fd);
                let document = serde_json::to_vec(&inputs[0].storage_metadata).unwrap();
                md.write_all(&document).unwrap();
                drop(md);
                let mut out = File::from(body.fd);
                for input in inputs {
                    let mut input = File::from(input.fd);
                    io::copy(&mut input, &mut out).unwrap();
                }
            });
            with_task_id("0badc0de")
        }
        Command::Cancel => ServiceReply::success("Cancelled"),
        _ => ServiceReply::success("OK"),
    })
}

/// A daemon that admits tasks and then never touches their fds
pub fn silent_daemon(path: &Path) -> FakeServer {
    let mut held = Vec::new();
    FakeServer::spawn(path, move |command, request| match command {
        Command::Execute => {
            held.push(request);
            with_task_id("deadbeef")
        }
        Command::Cancel => ServiceReply::success("Cancelled task deadbeef"),
        _ => ServiceReply::success("OK"),
    })
}

/// A factory whose daemons are echo daemons served from the host pipe dir
pub fn fake_factory(pipe_dir: &Path) -> FakeServer {
    let dir = pipe_dir.to_path_buf();
    let mut daemons: BTreeMap<String, FakeServer> = BTreeMap::new();
    FakeServer::spawn(&pipe_dir.join("factory_pipe"), move |command, request| {
        let name = request.param_str("storlet_name").unwrap_or("").to_string();
        match command {
            Command::Ping => ServiceReply::success("OK"),
            Command::StartDaemon => {
                if !daemons.contains_key(&name) {
                    daemons.insert(name.clone(), echo_daemon(&dir.join(&name)));
                }
                ServiceReply::success("OK")
            }
            Command::DaemonStatus if daemons.contains_key(&name) => {
                ServiceReply::success(format!("Storlet {} seems to be running", name))
            }
            Command::DaemonStatus => {
                ServiceReply::failure(format!("No running storlet daemons for {}", name))
            }
            Command::StopDaemon => match daemons.remove(&name) {
                Some(daemon) => {
                    daemon.halt();
                    ServiceReply::success(format!("Storlet {}, PID = 0, ErrCode = 0", name))
                }
                None => ServiceReply::failure(format!("{} is not found", name)),
            },
            _ => ServiceReply::failure("not supported"),
        }
    })
}

/// Container engine that only records what it was asked to do
#[derive(Default)]
pub struct FakeEngine {
    pub calls: Mutex<Vec<String>>,
    pub missing_images: Vec<String>,
    pub running: usize,
    /// Directory to start a fake factory in when a container runs
    pub factory_dir: Option<PathBuf>,
    pub factories: Mutex<Vec<FakeServer>>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("stop {}", name));
        Err(EngineError::NotFound(name.to_string()))
    }

    async fn count_labeled(&self, label: &str) -> Result<usize, EngineError> {
        self.calls.lock().unwrap().push(format!("count {}", label));
        Ok(self.running)
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("run {}", spec.image));
        if self.missing_images.contains(&spec.image) {
            return Err(EngineError::ImageNotFound(spec.image.clone()));
        }
        if let Some(dir) = &self.factory_dir {
            self.factories.lock().unwrap().push(fake_factory(dir));
        }
        Ok(())
    }
}

/// Storage holding storlet and dependency objects in memory
#[derive(Default)]
pub struct FakeFileManager {
    pub objects: Mutex<BTreeMap<String, (Vec<u8>, Option<String>)>>,
    pub fetched: Mutex<Vec<String>>,
    pub logs: Mutex<BTreeMap<String, Bytes>>,
}

impl FakeFileManager {
    pub fn with_object(self, name: &str, body: &[u8], permissions: Option<&str>) -> Self {
        self.objects.lock().unwrap().insert(
            name.to_string(),
            (body.to_vec(), permissions.map(String::from)),
        );
        self
    }

    fn fetch(&self, name: &str) -> Result<FetchedObject, StorletError> {
        self.fetched.lock().unwrap().push(name.to_string());
        match self.objects.lock().unwrap().get(name) {
            Some((body, permissions)) => Ok(FetchedObject {
                body: byte_stream(body.clone()),
                permissions: permissions.clone(),
            }),
            None => Err(StorletError::runtime(format!("{} not found", name))),
        }
    }
}

#[async_trait]
impl FileManager for FakeFileManager {
    async fn get_storlet(&self, name: &str) -> Result<FetchedObject, StorletError> {
        self.fetch(name)
    }

    async fn get_dependency(&self, name: &str) -> Result<FetchedObject, StorletError> {
        self.fetch(name)
    }

    async fn put_log(&self, name: &str, body: Bytes) -> Result<(), StorletError> {
        self.logs.lock().unwrap().insert(name.to_string(), body);
        Ok(())
    }
}

pub fn shared(manager: FakeFileManager) -> Arc<FakeFileManager> {
    Arc::new(manager)
}
