//! Gateway settings, read from a flat key/value map

use crate::errors::ConfigError;
use std::{collections::BTreeMap, str::FromStr, time::Duration};

/// Which container CLI drives the sandboxes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
    Podman,
}

impl EngineKind {
    pub fn program(&self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(EngineKind::Docker),
            "podman" => Ok(EngineKind::Podman),
            other => Err(ConfigError::UnsupportedEngine(other.to_string())),
        }
    }
}

/// Resource limits applied to every sandbox container; zero or `None` means unset
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceLimits {
    pub cpu_period: u64,
    pub cpu_quota: u64,
    pub mem_limit: Option<String>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub pids_limit: u64,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host_root: String,
    pub pipes_dir: Option<String>,
    pub storlets_dir: Option<String>,
    pub log_dir: Option<String>,
    pub cache_dir: Option<String>,

    pub sandbox_ping_interval: Duration,
    pub sandbox_stop_timeout: Duration,
    pub sandbox_wait_timeout: Duration,
    pub storlet_timeout: Duration,

    pub daemon_pool_size: u32,
    pub daemon_log_level: String,
    pub factory_log_level: String,
    pub sandbox_user: String,

    pub image_namespace: Option<String>,
    pub default_image_name: String,
    pub max_containers_per_node: usize,
    pub limits: ResourceLimits,

    pub engine: EngineKind,
    pub engine_socket: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host_root: "/var/lib/storlets".into(),
            pipes_dir: None,
            storlets_dir: None,
            log_dir: None,
            cache_dir: None,
            sandbox_ping_interval: Duration::from_millis(500),
            sandbox_stop_timeout: Duration::from_secs(1),
            sandbox_wait_timeout: Duration::from_secs(10),
            storlet_timeout: Duration::from_secs(40),
            daemon_pool_size: 5,
            daemon_log_level: "DEBUG".into(),
            factory_log_level: "DEBUG".into(),
            sandbox_user: "swift".into(),
            image_namespace: None,
            default_image_name: "storlet_engine_image".into(),
            max_containers_per_node: 0,
            limits: ResourceLimits::default(),
            engine: EngineKind::Docker,
            engine_socket: None,
        }
    }
}

fn parsed<T: FromStr>(
    conf: &BTreeMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match conf.get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.clone(),
        }),
    }
}

fn seconds(
    conf: &BTreeMap<String, String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs: f64 = parsed(conf, key, default.as_secs_f64())?;
    if !secs.is_finite() || secs < 0.0 {
        Err(ConfigError::InvalidValue {
            key,
            value: secs.to_string(),
        })?
    }
    Ok(Duration::from_secs_f64(secs))
}

fn nonempty(conf: &BTreeMap<String, String>, key: &str) -> Option<String> {
    conf.get(key).filter(|value| !value.is_empty()).cloned()
}

impl GatewayConfig {
    /// Read settings from the gateway's key/value configuration, filling defaults
    pub fn from_map(conf: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = GatewayConfig::default();
        let mem_limit = nonempty(conf, "container_mem_limit").filter(|limit| limit != "0");
        Ok(GatewayConfig {
            host_root: nonempty(conf, "host_root").unwrap_or(defaults.host_root),
            pipes_dir: nonempty(conf, "pipes_dir"),
            storlets_dir: nonempty(conf, "storlets_dir"),
            log_dir: nonempty(conf, "log_dir"),
            cache_dir: nonempty(conf, "cache_dir"),
            sandbox_ping_interval: seconds(
                conf,
                "sandbox_ping_interval",
                defaults.sandbox_ping_interval,
            )?,
            sandbox_stop_timeout: seconds(
                conf,
                "stop_linux_container_timeout",
                defaults.sandbox_stop_timeout,
            )?,
            sandbox_wait_timeout: seconds(
                conf,
                "restart_linux_container_timeout",
                defaults.sandbox_wait_timeout,
            )?,
            storlet_timeout: seconds(conf, "storlet_timeout", defaults.storlet_timeout)?,
            daemon_pool_size: parsed(
                conf,
                "storlet_daemon_thread_pool_size",
                defaults.daemon_pool_size,
            )?,
            daemon_log_level: nonempty(conf, "storlet_daemon_debug_level")
                .unwrap_or(defaults.daemon_log_level),
            factory_log_level: nonempty(conf, "storlet_daemon_factory_debug_level")
                .unwrap_or(defaults.factory_log_level),
            sandbox_user: nonempty(conf, "sandbox_user").unwrap_or(defaults.sandbox_user),
            image_namespace: nonempty(conf, "docker_repo")
                .or_else(|| nonempty(conf, "container_image_namespace")),
            default_image_name: nonempty(conf, "default_docker_image_name")
                .or_else(|| nonempty(conf, "default_container_image_name"))
                .unwrap_or(defaults.default_image_name),
            max_containers_per_node: parsed(conf, "max_containers_per_node", 0)?,
            limits: ResourceLimits {
                cpu_period: parsed(conf, "container_cpu_period", 0)?,
                cpu_quota: parsed(conf, "container_cpu_quota", 0)?,
                mem_limit,
                cpuset_cpus: nonempty(conf, "container_cpuset_cpus"),
                cpuset_mems: nonempty(conf, "container_cpuset_mems"),
                pids_limit: parsed(conf, "container_pids_limit", 0)?,
            },
            engine: parsed(conf, "container_engine", defaults.engine)?,
            engine_socket: nonempty(conf, "container_engine_socket")
                .or_else(|| nonempty(conf, "socket_path")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let conf = GatewayConfig::from_map(&BTreeMap::new()).unwrap();
        assert_eq!(conf.host_root, "/var/lib/storlets");
        assert_eq!(conf.sandbox_ping_interval, Duration::from_millis(500));
        assert_eq!(conf.storlet_timeout, Duration::from_secs(40));
        assert_eq!(conf.daemon_pool_size, 5);
        assert_eq!(conf.default_image_name, "storlet_engine_image");
        assert_eq!(conf.engine, EngineKind::Docker);
        assert_eq!(conf.limits, ResourceLimits::default());
    }

    #[test]
    fn legacy_docker_names_win() {
        let conf = GatewayConfig::from_map(&map(&[
            ("docker_repo", "registry:5000"),
            ("container_image_namespace", "ignored"),
            ("default_container_image_name", "fallback"),
            ("container_mem_limit", "1024m"),
            ("container_pids_limit", "200"),
            ("container_engine", "podman"),
        ]))
        .unwrap();
        assert_eq!(conf.image_namespace.as_deref(), Some("registry:5000"));
        assert_eq!(conf.default_image_name, "fallback");
        assert_eq!(conf.limits.mem_limit.as_deref(), Some("1024m"));
        assert_eq!(conf.limits.pids_limit, 200);
        assert_eq!(conf.engine, EngineKind::Podman);
    }

    #[test]
    fn bad_numbers() {
        assert!(GatewayConfig::from_map(&map(&[("storlet_timeout", "soon")])).is_err());
        assert!(GatewayConfig::from_map(&map(&[("storlet_timeout", "-1")])).is_err());
        assert!(GatewayConfig::from_map(&map(&[("max_containers_per_node", "x")])).is_err());
        assert!(GatewayConfig::from_map(&map(&[("container_engine", "lxc")])).is_err());
    }
}
