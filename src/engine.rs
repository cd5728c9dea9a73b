//! Container engines able to host a scope's sandbox

use crate::{
    config::{EngineKind, GatewayConfig, ResourceLimits},
    errors::EngineError,
};
use async_trait::async_trait;
use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};
use tokio::process::Command;

/// A host directory bound into the container
#[derive(Clone, Debug, PartialEq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// Everything needed to start one sandbox container
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
    pub limits: ResourceLimits,
}

/// The few container operations a sandbox needs
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Stop a container by name, reporting [EngineError::NotFound] if there is none
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Number of running containers carrying the `key=value` label
    async fn count_labeled(&self, label: &str) -> Result<usize, EngineError>;

    /// Start a detached, auto-removed container
    async fn run(&self, spec: &ContainerSpec) -> Result<(), EngineError>;
}

/// Engine driven through the `docker` or `podman` command line
#[derive(Clone, Debug)]
pub struct CliEngine {
    kind: EngineKind,
    socket: Option<String>,
}

impl CliEngine {
    pub fn new(kind: EngineKind) -> Self {
        CliEngine { kind, socket: None }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        CliEngine {
            kind: config.engine,
            socket: config.engine_socket.clone(),
        }
    }

    /// Talk to the engine through this unix socket instead of its default
    pub fn socket<S: Into<String>>(mut self, path: S) -> Self {
        self.socket = Some(path.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.kind.program());
        if let Some(socket) = &self.socket {
            let var = match self.kind {
                EngineKind::Docker => "DOCKER_HOST",
                EngineKind::Podman => "CONTAINER_HOST",
            };
            cmd.env(var, format!("unix://{}", socket));
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Arguments for `run`, after the subcommand itself
    pub fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--rm".into(),
            "--name".into(),
            spec.name.clone(),
            "--network".into(),
            "none".into(),
        ];
        if self.kind == EngineKind::Podman {
            args.extend(vec!["--userns".into(), "keep-id".into()]);
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for mount in &spec.mounts {
            let mut desc = format!(
                "type=bind,source={},target={}",
                mount.source.display(),
                mount.target.display()
            );
            if mount.read_only {
                desc.push_str(",readonly");
            }
            args.push("--mount".into());
            args.push(desc);
        }

        let limits = &spec.limits;
        if limits.cpu_period > 0 {
            args.extend(vec!["--cpu-period".into(), limits.cpu_period.to_string()]);
        }
        if limits.cpu_quota > 0 {
            args.extend(vec!["--cpu-quota".into(), limits.cpu_quota.to_string()]);
        }
        if let Some(mem) = &limits.mem_limit {
            args.extend(vec!["--memory".into(), mem.clone()]);
        }
        if let Some(cpus) = &limits.cpuset_cpus {
            args.extend(vec!["--cpuset-cpus".into(), cpus.clone()]);
        }
        if let Some(mems) = &limits.cpuset_mems {
            args.extend(vec!["--cpuset-mems".into(), mems.clone()]);
        }
        if limits.pids_limit > 0 {
            args.extend(vec!["--pids-limit".into(), limits.pids_limit.to_string()]);
        }

        args.extend(vec!["--entrypoint".into(), spec.entrypoint.clone()]);
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

fn stderr_text(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), EngineError> {
        let output = self
            .command()
            .arg("stop")
            .arg("--time")
            .arg(timeout.as_secs().max(1).to_string())
            .arg(name)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_text(&output);
        if stderr.to_lowercase().contains("no such container") {
            Err(EngineError::NotFound(name.to_string()))
        } else {
            Err(EngineError::Api(stderr))
        }
    }

    async fn count_labeled(&self, label: &str) -> Result<usize, EngineError> {
        let output = self
            .command()
            .args(&["ps", "--quiet", "--filter"])
            .arg(format!("label={}", label))
            .output()
            .await?;
        if !output.status.success() {
            return Err(EngineError::Api(stderr_text(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        let args = self.run_args(spec);
        log::debug!("{} {}", self.kind.program(), args.join(" "));
        let output = self.command().args(&args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_text(&output);
        let lower = stderr.to_lowercase();
        if lower.contains("unable to find image")
            || lower.contains("manifest unknown")
            || lower.contains("image not known")
            || lower.contains("pull access denied")
        {
            Err(EngineError::ImageNotFound(spec.image.clone()))
        } else {
            Err(EngineError::Api(stderr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert("managed_by".to_string(), "storlets".to_string());
        ContainerSpec {
            name: "tenant_abc".into(),
            image: "repo/abc".into(),
            entrypoint: "/usr/local/libexec/storlets/storlets-daemon-factory".into(),
            args: vec!["/mnt/channels/factory_pipe".into(), "DEBUG".into()],
            mounts: vec![Mount {
                source: "/host/pipes".into(),
                target: "/mnt/channels".into(),
                read_only: false,
            }],
            labels,
            limits: ResourceLimits {
                pids_limit: 100,
                mem_limit: Some("512m".into()),
                ..ResourceLimits::default()
            },
        }
    }

    #[test]
    fn docker_run_args() {
        let args = CliEngine::new(EngineKind::Docker).run_args(&spec());
        let line = args.join(" ");
        assert!(line.starts_with("run --detach --rm --name tenant_abc --network none"));
        assert!(line.contains("--label managed_by=storlets"));
        assert!(line.contains("--mount type=bind,source=/host/pipes,target=/mnt/channels "));
        assert!(line.contains("--memory 512m"));
        assert!(line.contains("--pids-limit 100"));
        assert!(!line.contains("--cpu-quota"));
        assert!(!line.contains("--userns"));
        assert!(line.ends_with("repo/abc /mnt/channels/factory_pipe DEBUG"));
    }

    #[test]
    fn podman_keeps_user_namespace() {
        let args = CliEngine::new(EngineKind::Podman).run_args(&spec());
        assert!(args.join(" ").contains("--userns keep-id"));
    }
}
