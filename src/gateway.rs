//! Entry point for the storage side: run one storlet request in its scope's sandbox

use crate::{
    cache,
    config::GatewayConfig,
    engine::{CliEngine, ContainerEngine},
    errors::{GatewayError, StorletError, ValidationError},
    invocation::{StorletInvocationProtocol, StorletResponse},
    paths::RunTimePaths,
    request::{FileManager, StorletRequest},
    sandbox::RunTimeSandbox,
    validation,
};
use bytes::Bytes;
use serde_json::Value;
use std::{collections::BTreeMap, path::Path, sync::Arc};

/// Runs storlets for one scope
pub struct StorletGateway {
    config: GatewayConfig,
    scope: String,
    paths: RunTimePaths,
    engine: Arc<dyn ContainerEngine>,
}

impl StorletGateway {
    pub fn new<S: Into<String>>(
        config: GatewayConfig,
        scope: S,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        let scope = scope.into();
        StorletGateway {
            paths: RunTimePaths::new(scope.clone(), &config),
            config,
            scope,
            engine,
        }
    }

    /// A gateway driving containers through the configured engine CLI
    pub fn with_cli_engine<S: Into<String>>(config: GatewayConfig, scope: S) -> Self {
        let engine = Arc::new(CliEngine::from_config(&config));
        StorletGateway::new(config, scope, engine)
    }

    pub fn paths(&self) -> &RunTimePaths {
        &self.paths
    }

    pub fn sandbox(&self) -> RunTimeSandbox {
        RunTimeSandbox::new(self.scope.clone(), &self.config, self.engine.clone())
    }

    pub fn validate_storlet_registration(
        params: &BTreeMap<String, String>,
        name: &str,
    ) -> Result<(), ValidationError> {
        validation::validate_storlet_registration(params, name)
    }

    pub fn validate_dependency_registration(
        params: &BTreeMap<String, String>,
        name: &str,
    ) -> Result<(), ValidationError> {
        validation::validate_dependency_registration(params, name)
    }

    /// Refresh code, make sure the daemon is up, then run the request
    pub async fn invocation_flow(
        &self,
        mut request: StorletRequest,
    ) -> Result<StorletResponse, StorletError> {
        let sandbox = self.sandbox();
        let updated = cache::update_sandbox_from_cache(&self.paths, &request).await?;
        sandbox
            .activate_storlet_daemon(&request.storlet_id, &request.options, updated)
            .await?;
        self.add_system_params(&mut request);

        let main = request.options.storlet_main.clone();
        let log_path = self.paths.host_log_path(&main);
        let protocol = StorletInvocationProtocol::new(
            self.paths.host_storlet_pipe(&main),
            log_path.clone(),
            self.config.storlet_timeout,
        );

        let log_upload = if request.options.generate_log {
            Some((
                request.options.file_manager.clone(),
                request.storlet_id.clone(),
            ))
        } else {
            None
        };
        let response = protocol.communicate(request).await?;
        if let Some((file_manager, storlet_id)) = log_upload {
            upload_storlet_log(file_manager.as_ref(), &log_path, &storlet_id).await?;
        }
        Ok(response)
    }

    /// Like [invocation_flow](Self::invocation_flow), with internal failures hidden
    pub async fn invoke(&self, request: StorletRequest) -> Result<StorletResponse, GatewayError> {
        self.invocation_flow(request).await.map_err(|err| match err {
            StorletError::InvalidRequest(message) => GatewayError::BadRequest(message),
            other => {
                log::error!("storlet invocation failed in scope {}: {}", self.scope, other);
                GatewayError::ServiceUnavailable
            }
        })
    }

    fn add_system_params(&self, request: &mut StorletRequest) {
        let path = self
            .paths
            .sandbox_storlet_dir(&request.options.storlet_main);
        request.params.insert(
            "storlet_execution_path".into(),
            Value::String(path.to_string_lossy().into_owned()),
        );
    }
}

/// Store the execution log next to the storlet, as `<name>.log`
async fn upload_storlet_log(
    file_manager: &dyn FileManager,
    log_path: &Path,
    storlet_id: &str,
) -> Result<(), StorletError> {
    let body = tokio::fs::read(log_path).await?;
    let name = storlet_id.split('-').next().unwrap_or(storlet_id);
    file_manager
        .put_log(&format!("{}.log", name), Bytes::from(body))
        .await
}
