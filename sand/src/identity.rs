//! Dropping root before serving any command

use crate::errors::SandError;
use std::{ffi::CString, io};

/// Switch real, effective and saved ids to the named account
pub fn switch_user(name: &str) -> Result<(), SandError> {
    let c_name = CString::new(name).map_err(|_| SandError::UnknownUser(name.to_string()))?;
    let passwd = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if passwd.is_null() {
        Err(SandError::UnknownUser(name.to_string()))?
    }
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };

    // group first, we lose the right to change it once the uid is dropped
    if unsafe { libc::setresgid(gid, gid, gid) } < 0 {
        Err(io::Error::last_os_error())?
    }
    if unsafe { libc::setresuid(uid, uid, uid) } < 0 {
        Err(io::Error::last_os_error())?
    }
    log::debug!("running as {} ({}:{})", name, uid, gid);
    Ok(())
}
