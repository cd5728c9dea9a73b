//! SBus: the datagram protocol spoken between the storlets gateway, the
//! daemon factory inside each sandbox, and the storlet daemons it starts.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("storlets only works on linux or android");


pub mod buffer;
pub mod client;
pub mod errors;
pub mod transport;

mod messages;
mod types;

pub use crate::{
    client::{DaemonSpec, SBusClient},
    errors::{ClientError, ProtocolError},
    transport::{Readiness, SBus},
};
pub use messages::*;
pub use types::*;
