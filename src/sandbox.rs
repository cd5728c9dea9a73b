//! Lifecycle of one scope's sandbox container and the daemons inside it

use crate::{
    config::GatewayConfig,
    engine::{ContainerEngine, ContainerSpec, Mount},
    errors::{EngineError, StorletError},
    paths::{
        RunTimePaths, SANDBOX_PIPE_DIR, SANDBOX_STORLET_BASE_DIR, STORLET_NATIVE_BIN_DIR,
        STORLET_NATIVE_LIB_DIR,
    },
    request::RequestOptions,
};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use storlets_protocol::{ClientError, DaemonSpec, SBusClient, ServiceReply};
use tokio::{task, time};

const CONTAINER_NAME_PREFIX: &str = "tenant";
const MANAGED_LABEL: (&str, &str) = ("managed_by", "storlets");
const FACTORY_BINARY: &str = "storlets-daemon-factory";

/// What the factory says about one storlet's daemon
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonStatus {
    Running,
    Stopped,
    /// The factory itself did not answer
    Unreachable,
}

pub struct RunTimeSandbox {
    paths: RunTimePaths,
    config: GatewayConfig,
    engine: Arc<dyn ContainerEngine>,
}

impl RunTimeSandbox {
    pub fn new<S: Into<String>>(
        scope: S,
        config: &GatewayConfig,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        RunTimeSandbox {
            paths: RunTimePaths::new(scope, config),
            config: config.clone(),
            engine,
        }
    }

    pub fn paths(&self) -> &RunTimePaths {
        &self.paths
    }

    /// Run a blocking request against the factory channel
    async fn factory_request<F>(&self, request: F) -> Result<ServiceReply, StorletError>
    where
        F: FnOnce(SBusClient) -> Result<ServiceReply, ClientError> + Send + 'static,
    {
        let client = SBusClient::new(self.paths.host_factory_pipe());
        Ok(task::spawn_blocking(move || request(client)).await??)
    }

    /// Whether the factory inside the sandbox answers
    pub async fn ping(&self) -> bool {
        match self.factory_request(|client| client.ping()).await {
            Ok(reply) if reply.status => true,
            Ok(reply) => {
                log::error!("failed to ping the daemon factory: {}", reply.message);
                false
            }
            Err(_) => false,
        }
    }

    /// Wait for the factory to come up, polling at the configured interval
    pub async fn wait(&self) -> Result<(), StorletError> {
        let budget = self.config.sandbox_wait_timeout;
        let interval = self.config.sandbox_ping_interval;
        let polling = async {
            while !self.ping().await {
                time::sleep(interval).await;
            }
        };
        time::timeout(budget, polling)
            .await
            .map_err(|_| StorletError::Timeout(budget))
    }

    pub fn container_name(&self) -> String {
        format!("{}_{}", CONTAINER_NAME_PREFIX, self.paths.scope())
    }

    fn image_name(&self, image: &str) -> String {
        match &self.config.image_namespace {
            Some(namespace) => format!("{}/{}", namespace, image),
            None => image.to_string(),
        }
    }

    /// The container that hosts this scope's factory
    pub fn container_spec(&self, image: &str) -> ContainerSpec {
        let name = self.container_name();
        let bin_dir = Path::new(STORLET_NATIVE_BIN_DIR);
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.0.to_string(), MANAGED_LABEL.1.to_string());

        let mount = |source: &Path, target: &str, read_only| Mount {
            source: source.to_path_buf(),
            target: target.into(),
            read_only,
        };
        ContainerSpec {
            image: self.image_name(image),
            entrypoint: bin_dir.join(FACTORY_BINARY).to_string_lossy().into_owned(),
            args: vec![
                self.paths.sandbox_factory_pipe().to_string_lossy().into_owned(),
                self.config.factory_log_level.clone(),
                name.clone(),
                "--user".into(),
                self.config.sandbox_user.clone(),
                "--log-relay".into(),
                "logger".into(),
            ],
            mounts: vec![
                mount(&self.paths.host_pipe_dir(), SANDBOX_PIPE_DIR, false),
                mount(
                    &self.paths.host_storlet_base_dir(),
                    SANDBOX_STORLET_BASE_DIR,
                    true,
                ),
                mount(
                    Path::new(STORLET_NATIVE_LIB_DIR),
                    STORLET_NATIVE_LIB_DIR,
                    true,
                ),
                mount(bin_dir, STORLET_NATIVE_BIN_DIR, true),
            ],
            labels,
            limits: self.config.limits.clone(),
            name,
        }
    }

    /// Replace the scope's container with a fresh one from `image`
    async fn restart_with(&self, image: &str) -> Result<(), StorletError> {
        let name = self.container_name();
        match self
            .engine
            .stop(&name, self.config.sandbox_stop_timeout)
            .await
        {
            Ok(()) => log::debug!("stopped container {}", name),
            Err(EngineError::NotFound(_)) => {}
            Err(err) => Err(err)?,
        }

        let limit = self.config.max_containers_per_node;
        if limit > 0 {
            let label = format!("{}={}", MANAGED_LABEL.0, MANAGED_LABEL.1);
            if self.engine.count_labeled(&label).await? >= limit {
                Err(StorletError::runtime(
                    "Cannot start a container because of limit",
                ))?
            }
        }

        self.engine.run(&self.container_spec(image)).await?;
        Ok(())
    }

    /// Restart the sandbox, falling back once to the default image
    pub async fn restart(&self) -> Result<(), StorletError> {
        self.paths.create_host_pipe_dir()?;

        let scope_image = self.paths.scope().to_string();
        let first = match self.restart_with(&scope_image).await {
            Ok(()) => self.wait().await,
            Err(err) => Err(err),
        };
        match first {
            Ok(()) => Ok(()),
            Err(err @ StorletError::Timeout(_)) => Err(err),
            Err(err) => {
                log::error!(
                    "failed to start a container from scope image {}: {}",
                    scope_image,
                    err
                );
                let default_image = self.config.default_image_name.clone();
                log::info!(
                    "trying to start a container from default image {}",
                    default_image
                );
                self.restart_with(&default_image).await?;
                self.wait().await
            }
        }
    }

    pub async fn start_storlet_daemon(
        &self,
        storlet_path: String,
        storlet_id: &str,
        language: &str,
        language_version: Option<String>,
    ) -> Result<(), StorletError> {
        let spec = DaemonSpec {
            language: language.to_lowercase(),
            language_version,
            storlet_path,
            storlet_name: storlet_id.to_string(),
            uds_path: self
                .paths
                .sandbox_storlet_pipe(storlet_id)
                .to_string_lossy()
                .into_owned(),
            log_level: self.config.daemon_log_level.clone(),
            pool_size: self.config.daemon_pool_size,
        };
        match self.factory_request(move |client| client.start_daemon(&spec)).await {
            Ok(reply) if reply.status => Ok(()),
            Ok(reply) => {
                log::error!("failed to start storlet daemon: {}", reply.message);
                Err(StorletError::runtime("Daemon start failed"))
            }
            Err(err) => {
                log::debug!("start_daemon for {} not delivered: {}", storlet_id, err);
                Err(StorletError::runtime("Daemon start failed"))
            }
        }
    }

    pub async fn stop_storlet_daemon(&self, storlet_id: &str) -> Result<(), StorletError> {
        let name = storlet_id.to_string();
        match self.factory_request(move |client| client.stop_daemon(&name)).await {
            Ok(reply) if reply.status => Ok(()),
            Ok(reply) => {
                log::error!("failed to stop storlet daemon: {}", reply.message);
                Err(StorletError::runtime("Daemon stop failed"))
            }
            Err(err) => {
                log::debug!("stop_daemon for {} not delivered: {}", storlet_id, err);
                Err(StorletError::runtime("Daemon stop failed"))
            }
        }
    }

    pub async fn storlet_daemon_status(&self, storlet_id: &str) -> DaemonStatus {
        let name = storlet_id.to_string();
        match self
            .factory_request(move |client| client.daemon_status(&name))
            .await
        {
            Ok(reply) if reply.status => DaemonStatus::Running,
            Ok(reply) => {
                log::debug!("storlet daemon status: {}", reply.message);
                DaemonStatus::Stopped
            }
            Err(err) => {
                log::debug!("daemon_status for {} not delivered: {}", storlet_id, err);
                DaemonStatus::Unreachable
            }
        }
    }

    /// Code path handed to the daemon: the storlet file, then its dependencies
    pub fn storlet_classpath(
        &self,
        storlet_main: &str,
        storlet_id: &str,
        dependencies: &[String],
    ) -> String {
        let dir = self.paths.sandbox_storlet_dir(storlet_main);
        std::iter::once(storlet_id)
            .chain(dependencies.iter().map(String::as_str))
            .map(|name| dir.join(name).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Make sure a daemon running current code is up for this storlet
    pub async fn activate_storlet_daemon(
        &self,
        storlet_id: &str,
        options: &RequestOptions,
        cache_updated: bool,
    ) -> Result<(), StorletError> {
        let main = &options.storlet_main;
        let mut status = self.storlet_daemon_status(main).await;
        if status == DaemonStatus::Unreachable {
            log::debug!("failed to check the storlet daemon status, restarting its container");
            self.restart().await?;
            status = DaemonStatus::Stopped;
        }

        if cache_updated && status == DaemonStatus::Running {
            log::debug!("the cache was updated while the daemon is running, stopping it");
            if let Err(err) = self.stop_storlet_daemon(main).await {
                log::warn!("{}, restarting the container", err);
                self.restart().await?;
            }
            status = DaemonStatus::Stopped;
        }

        if status == DaemonStatus::Stopped {
            log::debug!("starting the storlet daemon for {}", main);
            let classpath = self.storlet_classpath(main, storlet_id, &options.dependencies);
            self.start_storlet_daemon(
                classpath,
                main,
                &options.storlet_language,
                options.storlet_language_version.clone(),
            )
            .await?;
            log::debug!("daemon for {} started", main);
        }
        Ok(())
    }
}
