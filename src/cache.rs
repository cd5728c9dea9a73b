//! Two-tier code cache: storage, then a node-local cache, then the sandbox copy
//!
//! Freshness is judged by size and modification time only.

use crate::{
    errors::StorletError,
    paths::RunTimePaths,
    request::{DeclaredAttributes, StorletRequest},
};
use futures_util::StreamExt;
use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::Path,
};
use tokio::io::AsyncWriteExt;

const STORLET_DEFAULT_MODE: u32 = 0o600;
const DEPENDENCY_DEFAULT_MODE: u32 = 0o700;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Storlet,
    Dependency,
}

fn create_dir(path: &Path, mode: u32) -> io::Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    fs::DirBuilder::new().recursive(true).mode(mode).create(path)?;
    Ok(true)
}

/// Whether the node cache must be refetched from storage
pub fn node_copy_is_stale(path: &Path, declared: Option<&DeclaredAttributes>) -> io::Result<bool> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    };
    Ok(match declared {
        Some(declared) => {
            metadata.len() != declared.size || metadata.modified()? < declared.timestamp
        }
        None => false,
    })
}

/// Whether the sandbox copy must be replaced by the node cache's copy
pub fn sandbox_copy_is_stale(cached: &Path, sandbox: &Path) -> io::Result<bool> {
    let copy = match fs::metadata(sandbox) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    };
    let original = fs::metadata(cached)?;
    Ok(original.len() != copy.len() || copy.modified()? < original.modified()?)
}

/// Owner bits of a stored octal permission string, or the default for the kind
pub fn cache_mode(permissions: Option<&str>, kind: ObjectKind) -> Result<u32, StorletError> {
    match permissions.map(str::trim).filter(|perm| !perm.is_empty()) {
        Some(perm) => u32::from_str_radix(perm, 8)
            .map(|mode| mode & 0o700)
            .map_err(|_| StorletError::runtime(format!("invalid permission {:?}", perm))),
        None => Ok(match kind {
            ObjectKind::Storlet => STORLET_DEFAULT_MODE,
            ObjectKind::Dependency => DEPENDENCY_DEFAULT_MODE,
        }),
    }
}

/// Copy preserving permission bits and modification time
fn copy_preserving(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    let modified = fs::metadata(from)?.modified()?;
    fs::OpenOptions::new().write(true).open(to)?.set_modified(modified)?;
    Ok(())
}

/// Make sure one object is current in the node cache and in the sandbox
///
/// Returns whether the sandbox copy changed.
pub async fn bring_from_cache(
    paths: &RunTimePaths,
    request: &StorletRequest,
    obj_name: &str,
    kind: ObjectKind,
) -> Result<bool, StorletError> {
    let options = &request.options;
    let (cache_dir, declared) = match kind {
        ObjectKind::Storlet => (
            paths.host_storlet_cache_dir(),
            options.storlet_attributes.as_ref(),
        ),
        ObjectKind::Dependency => (paths.host_dependency_cache_dir(), None),
    };
    create_dir(&cache_dir, 0o700)?;

    let cached = cache_dir.join(obj_name);
    if node_copy_is_stale(&cached, declared)? {
        log::debug!("fetching {} into the node cache", obj_name);
        let fetched = match kind {
            ObjectKind::Storlet => options.file_manager.get_storlet(obj_name).await?,
            ObjectKind::Dependency => options.file_manager.get_dependency(obj_name).await?,
        };
        let mode = cache_mode(fetched.permissions.as_deref(), kind)?;

        let partial = cache_dir.join(format!(".{}.part", obj_name));
        let mut file = tokio::fs::File::create(&partial).await?;
        tokio::fs::set_permissions(&partial, Permissions::from_mode(mode)).await?;
        let mut body = fetched.body;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &cached).await?;
    }

    let sandbox_dir = paths.host_storlet_dir(&options.storlet_main);
    let sandbox_copy = sandbox_dir.join(obj_name);
    let created = create_dir(&sandbox_dir, 0o700)?;
    if created || sandbox_copy_is_stale(&cached, &sandbox_copy)? {
        log::debug!("copying {} into {}", obj_name, sandbox_dir.display());
        let (from, to) = (cached.clone(), sandbox_copy.clone());
        tokio::task::spawn_blocking(move || copy_preserving(&from, &to)).await??;
        return Ok(true);
    }
    Ok(false)
}

/// Bring the storlet and every dependency up to date in the sandbox
///
/// Returns true when any of them changed, so a running daemon has stale code.
pub async fn update_sandbox_from_cache(
    paths: &RunTimePaths,
    request: &StorletRequest,
) -> Result<bool, StorletError> {
    create_dir(&paths.host_storlet_base_dir(), 0o755)?;

    let mut updated =
        bring_from_cache(paths, request, &request.storlet_id, ObjectKind::Storlet).await?;
    for dep in &request.options.dependencies {
        updated |= bring_from_cache(paths, request, dep, ObjectKind::Dependency).await?;
    }
    Ok(updated)
}
