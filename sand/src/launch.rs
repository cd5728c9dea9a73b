//! Command lines for starting a storlet daemon in each supported language

use crate::errors::SandError;
use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
};
use storlets_protocol::DaemonSpec;

pub const STORLET_LIB_DIR: &str = "/usr/local/lib/storlets";
pub const STORLET_BIN_DIR: &str = "/usr/local/libexec/storlets";
pub const SANDBOX_STORLET_DIR: &str = "/home/swift";

const JAVA: &str = "/usr/bin/java";
const JAVA_DAEMON_MAIN: &str = "org.openstack.storlet.daemon.SDaemon";
const JAVA_DAEMON_JARS: &[&str] = &[
    "logback-classic-1.1.2.jar",
    "logback-core-1.1.2.jar",
    "slf4j-api-1.7.7.jar",
    "json_simple-1.1.jar",
    "SBusJavaFacade.jar",
    "SCommon.jar",
    "SDaemon.jar",
];

/// Program, arguments and the complete environment for one daemon
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).env_clear().envs(self.env.iter().cloned());
        cmd
    }
}

/// Prepend an inherited search path, if the factory itself has one
fn with_inherited(var: &str, path: String) -> String {
    match env::var(var) {
        Ok(inherited) if !inherited.is_empty() => format!("{}:{}", inherited, path),
        _ => path,
    }
}

pub struct Launcher {
    container_id: String,
    native_daemon: PathBuf,
}

impl Launcher {
    pub fn new<S: Into<String>>(container_id: S) -> Self {
        Launcher {
            container_id: container_id.into(),
            native_daemon: Path::new(STORLET_BIN_DIR).join("storlets-daemon"),
        }
    }

    /// Binary used for `native` storlets
    pub fn native_daemon<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.native_daemon = path.into();
        self
    }

    fn tail(&self, spec: &DaemonSpec) -> Vec<String> {
        vec![
            spec.storlet_name.clone(),
            spec.uds_path.clone(),
            spec.log_level.clone(),
            spec.pool_size.to_string(),
            self.container_id.clone(),
        ]
    }

    pub fn command(&self, spec: &DaemonSpec) -> Result<LaunchCommand, SandError> {
        match spec.language.to_lowercase().as_str() {
            "java" => Ok(self.java(spec)),
            "python" => self.python(spec),
            "native" => Ok(self.native(spec)),
            other => Err(SandError::UnsupportedLanguage(other.to_string())),
        }
    }

    fn java(&self, spec: &DaemonSpec) -> LaunchCommand {
        let java_lib_dir = Path::new(STORLET_LIB_DIR).join("java");
        let mut classpath: Vec<String> = JAVA_DAEMON_JARS
            .iter()
            .map(|jar| java_lib_dir.join(jar).to_string_lossy().into_owned())
            .collect();
        classpath.push(spec.storlet_path.clone());
        let library_path = format!("{}:{}", STORLET_LIB_DIR, java_lib_dir.to_string_lossy());

        let mut args = vec![JAVA_DAEMON_MAIN.to_string()];
        args.extend(self.tail(spec));
        LaunchCommand {
            program: PathBuf::from(JAVA),
            args,
            env: vec![
                (
                    "CLASSPATH".into(),
                    with_inherited("CLASSPATH", classpath.join(":")),
                ),
                (
                    "LD_LIBRARY_PATH".into(),
                    with_inherited("LD_LIBRARY_PATH", library_path),
                ),
            ],
        }
    }

    fn python(&self, spec: &DaemonSpec) -> Result<LaunchCommand, SandError> {
        let version = spec.language_version.as_deref().unwrap_or("3");
        let major = version.split('.').next().unwrap_or("");
        if major != "3" {
            Err(SandError::UnsupportedLanguage(format!("python{}", version)))?
        }

        let mut args = vec![Path::new(STORLET_BIN_DIR)
            .join("storlets-daemon")
            .to_string_lossy()
            .into_owned()];
        args.extend(self.tail(spec));
        let python_path = Path::new(SANDBOX_STORLET_DIR).join(&spec.storlet_name);
        Ok(LaunchCommand {
            program: PathBuf::from(format!("/usr/bin/python{}", version)),
            args,
            env: vec![(
                "PYTHONPATH".into(),
                with_inherited("PYTHONPATH", python_path.to_string_lossy().into_owned()),
            )],
        })
    }

    fn native(&self, spec: &DaemonSpec) -> LaunchCommand {
        let mut env = vec![("STORLET_PATH".to_string(), spec.storlet_path.clone())];
        if let Ok(filter) = env::var("RUST_LOG") {
            env.push(("RUST_LOG".into(), filter));
        }
        LaunchCommand {
            program: self.native_daemon.clone(),
            args: self.tail(spec),
            env,
        }
    }
}
