//! Run untrusted storlets against object data, each scope in its own container
//!
//! The gateway keeps storlet code fresh inside a scope's sandbox, asks the
//! sandbox's daemon factory for a daemon, and streams one request through the
//! daemon's channel. See [StorletGateway] for the entry point.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("storlets only works on linux or android");

#[macro_use] extern crate lazy_static;

pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod invocation;
pub mod paths;
pub mod request;
pub mod sandbox;
pub mod validation;

pub use crate::{
    config::GatewayConfig,
    gateway::StorletGateway,
    invocation::{StorletOutputStream, StorletResponse},
    request::{FileManager, RequestOptions, StorletData, StorletRequest},
};
