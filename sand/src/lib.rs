//! Processes that run inside a storlets sandbox
//!
//! The daemon factory is the sandbox's entry point. It launches one storlet
//! daemon per storlet, and each daemon forks one worker per invocation.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("storlets only works on linux or android");

pub mod daemon;
pub mod errors;
pub mod factory;
pub mod files;
pub mod identity;
pub mod launch;
pub mod logging;
pub mod process;
pub mod server;
pub mod storlet;

pub use crate::{daemon::StorletDaemon, factory::DaemonFactory, server::CommandResponse};
