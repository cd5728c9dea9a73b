//! Where pipes, code, logs and caches live, on the host and inside a sandbox
//!
//! Every scope gets its own directory under each host root. The pipe and code
//! directories are bind-mounted into the scope's container, so each of them
//! has a host side path and a sandbox side path:
//!
//! | what            | host                                  | sandbox                   |
//! |-----------------|---------------------------------------|---------------------------|
//! | factory channel | `<pipes>/<scope>/factory_pipe`        | `/mnt/channels/factory_pipe` |
//! | daemon channel  | `<pipes>/<scope>/<storlet>`           | `/mnt/channels/<storlet>` |
//! | storlet code    | `<storlets>/<scope>/<storlet>`        | `/home/swift/<storlet>`   |

use crate::config::GatewayConfig;
use std::{
    fs,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

const FACTORY_PIPE_NAME: &str = "factory_pipe";
pub const SANDBOX_PIPE_DIR: &str = "/mnt/channels";
pub const SANDBOX_STORLET_BASE_DIR: &str = "/home/swift";
pub const STORLET_NATIVE_LIB_DIR: &str = "/usr/local/lib/storlets";
pub const STORLET_NATIVE_BIN_DIR: &str = "/usr/local/libexec/storlets";

#[derive(Clone, Debug)]
pub struct RunTimePaths {
    scope: String,
    host_pipe_root: PathBuf,
    host_storlet_root: PathBuf,
    host_log_root: PathBuf,
    host_cache_root: PathBuf,
}

impl RunTimePaths {
    pub fn new<S: Into<String>>(scope: S, config: &GatewayConfig) -> Self {
        let root = Path::new(&config.host_root);
        let dir = |configured: &Option<String>, default: &str| match configured {
            Some(path) => PathBuf::from(path),
            None => root.join(default).join("scopes"),
        };
        RunTimePaths {
            scope: scope.into(),
            host_pipe_root: dir(&config.pipes_dir, "pipes"),
            host_storlet_root: dir(&config.storlets_dir, "storlets"),
            host_log_root: dir(&config.log_dir, "logs"),
            host_cache_root: dir(&config.cache_dir, "cache"),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn host_pipe_dir(&self) -> PathBuf {
        self.host_pipe_root.join(&self.scope)
    }

    /// Create the scope's pipe directory, open to every user inside the sandbox
    pub fn create_host_pipe_dir(&self) -> io::Result<PathBuf> {
        let path = self.host_pipe_dir();
        fs::create_dir_all(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o777))?;
        Ok(path)
    }

    pub fn host_factory_pipe(&self) -> PathBuf {
        self.host_pipe_dir().join(FACTORY_PIPE_NAME)
    }

    pub fn sandbox_factory_pipe(&self) -> PathBuf {
        Path::new(SANDBOX_PIPE_DIR).join(FACTORY_PIPE_NAME)
    }

    pub fn host_storlet_pipe(&self, storlet_id: &str) -> PathBuf {
        self.host_pipe_dir().join(storlet_id)
    }

    pub fn sandbox_storlet_pipe(&self, storlet_id: &str) -> PathBuf {
        Path::new(SANDBOX_PIPE_DIR).join(storlet_id)
    }

    pub fn sandbox_storlet_dir(&self, storlet_id: &str) -> PathBuf {
        Path::new(SANDBOX_STORLET_BASE_DIR).join(storlet_id)
    }

    pub fn host_storlet_base_dir(&self) -> PathBuf {
        self.host_storlet_root.join(&self.scope)
    }

    pub fn host_storlet_dir(&self, storlet_id: &str) -> PathBuf {
        self.host_storlet_base_dir().join(storlet_id)
    }

    /// Execution log shared by every invocation of one storlet
    pub fn host_log_path(&self, storlet_id: &str) -> PathBuf {
        self.host_log_root
            .join(&self.scope)
            .join(storlet_id)
            .join("storlet_invoke.log")
    }

    pub fn host_storlet_cache_dir(&self) -> PathBuf {
        self.host_cache_root.join(&self.scope).join("storlet")
    }

    pub fn host_dependency_cache_dir(&self) -> PathBuf {
        self.host_cache_root.join(&self.scope).join("dependency")
    }
}
