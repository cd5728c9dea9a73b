//! Payload layout of one datagram
//!
//! Three native-endian `i32` header fields (fd count, metadata length,
//! params length) followed by the metadata JSON list and the params JSON
//! object. The fds themselves travel out of band.

use crate::{
    errors::ProtocolError,
    messages::{CommandParams, Datagram},
    types::{MAX_FDS, MAX_MSG_LENGTH},
};
use serde_json::Value;
use std::{convert::TryInto, mem::size_of};

pub const HEADER_LEN: usize = 3 * size_of::<i32>();

/// Decoded payload, still waiting to be paired with its fds
#[derive(Debug, PartialEq)]
pub struct Payload {
    pub num_fds: usize,
    pub metadata: Vec<Value>,
    pub cmd_params: CommandParams,
}

fn push_len(buf: &mut Vec<u8>, len: usize) -> Result<(), ProtocolError> {
    let len: i32 = len.try_into().map_err(|_| ProtocolError::MessageTooLarge)?;
    buf.extend_from_slice(&len.to_ne_bytes());
    Ok(())
}

fn read_len(bytes: &[u8], index: usize) -> Result<usize, ProtocolError> {
    let offset = index * size_of::<i32>();
    let field = bytes
        .get(offset..offset + size_of::<i32>())
        .ok_or(ProtocolError::Truncated)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(field);
    let len = i32::from_ne_bytes(raw);
    len.try_into().map_err(|_| ProtocolError::Truncated)
}

/// Serialize everything but the fds
pub fn encode(datagram: &Datagram) -> Result<Vec<u8>, ProtocolError> {
    let metadata = serde_json::to_vec(&datagram.metadata())?;
    let params = serde_json::to_vec(&datagram.cmd_params())?;
    let num_fds = datagram.sfds().len();
    if num_fds > MAX_FDS || HEADER_LEN + metadata.len() + params.len() > MAX_MSG_LENGTH {
        Err(ProtocolError::MessageTooLarge)?
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + metadata.len() + params.len());
    push_len(&mut buf, num_fds)?;
    push_len(&mut buf, metadata.len())?;
    push_len(&mut buf, params.len())?;
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(&params);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Payload, ProtocolError> {
    let num_fds = read_len(bytes, 0)?;
    let metadata_len = read_len(bytes, 1)?;
    let params_len = read_len(bytes, 2)?;
    if num_fds > MAX_FDS {
        Err(ProtocolError::MessageTooLarge)?
    }

    let body = &bytes[HEADER_LEN..];
    if body.len() < metadata_len + params_len {
        Err(ProtocolError::Truncated)?
    }
    let (metadata, rest) = body.split_at(metadata_len);
    let params = &rest[..params_len];

    // an empty metadata blob is how a datagram with no fds would be sent
    let metadata: Vec<Value> = if metadata.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(metadata)?
    };
    let cmd_params = serde_json::from_slice(params)?;
    Ok(Payload {
        num_fds,
        metadata,
        cmd_params,
    })
}
