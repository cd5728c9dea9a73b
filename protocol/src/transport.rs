//! Unix datagram channel that carries a payload plus attached fds
//!
//! A listener [SBus::create]s a channel at a filesystem path, then alternates
//! [SBus::listen] and [SBus::receive]. Senders use [send] with a fresh unbound
//! socket per message, so a missing listener is an ordinary send error.

use crate::{
    buffer,
    errors::ProtocolError,
    messages::Datagram,
    types::{MAX_FDS, MAX_MSG_LENGTH},
};
use std::{
    ffi::c_void,
    fs::{self, Permissions},
    io,
    mem::{self, size_of},
    os::unix::{
        ffi::OsStrExt,
        fs::PermissionsExt,
        io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        net::UnixDatagram,
    },
    path::{Path, PathBuf},
    ptr,
    time::Duration,
};

/// Result of waiting on a channel
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Listening end of a channel
#[derive(Debug)]
pub struct SBus {
    socket: UnixDatagram,
    path: PathBuf,
}

impl SBus {
    /// Bind a new channel, replacing any stale socket left at the same path
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => Err(err)?,
        }
        let socket = UnixDatagram::bind(path)?;
        fs::set_permissions(path, Permissions::from_mode(0o777))?;
        log::debug!("sbus channel bound at {:?}", path);
        Ok(SBus {
            socket,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until a datagram can be received, or forever with no timeout
    pub fn listen(&self, timeout: Option<Duration>) -> Result<Readiness, ProtocolError> {
        let timeout_ms = match timeout {
            Some(timeout) => timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        let mut pollfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                Err(err)?
            }
            return Ok(if result == 0 {
                Readiness::TimedOut
            } else {
                Readiness::Ready
            });
        }
    }

    /// Receive one datagram, taking ownership of every attached fd
    pub fn receive(&self) -> Result<Datagram, ProtocolError> {
        let mut payload = vec![0u8; MAX_MSG_LENGTH];
        let control_len = unsafe { libc::CMSG_SPACE((MAX_FDS * size_of::<RawFd>()) as u32) } as usize;
        // u64 storage keeps the control buffer aligned for cmsghdr
        let mut control = vec![0u64; (control_len + 7) / 8];

        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut c_void,
            iov_len: payload.len(),
        };
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = control.as_mut_ptr() as *mut c_void;
        hdr.msg_controllen = control_len as _;

        let received = loop {
            let result =
                unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut hdr, libc::MSG_CMSG_CLOEXEC) };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                Err(err)?
            }
            break result as usize;
        };

        // fds are owned from here on, so every error path below closes them
        let fds = unsafe { take_fds(&hdr) };
        if hdr.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
            Err(ProtocolError::MessageTooLarge)?
        }

        let payload = buffer::decode(&payload[..received])?;
        if payload.num_fds != fds.len() {
            Err(ProtocolError::FdCountMismatch {
                expected: payload.num_fds,
                received: fds.len(),
            })?
        }
        let datagram = Datagram::from_wire(fds, payload.metadata, payload.cmd_params)?;
        log::trace!(
            "received {} with fds {:?}",
            datagram.command(),
            datagram.fd_types()
        );
        Ok(datagram)
    }
}

impl Drop for SBus {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

unsafe fn take_fds(hdr: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    if hdr.msg_controllen == 0 {
        return fds;
    }
    let mut cmsg = libc::CMSG_FIRSTHDR(hdr);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let data = libc::CMSG_DATA(cmsg);
            let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
            for index in 0..len / size_of::<RawFd>() {
                let fd = ptr::read_unaligned(data.add(index * size_of::<RawFd>()) as *const RawFd);
                fds.push(OwnedFd::from_raw_fd(fd));
            }
        }
        cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
    }
    fds
}

fn socket_addr(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t), ProtocolError> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        Err(ProtocolError::InvalidPath(path.to_path_buf()))?
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// Send one datagram to the channel at `path`
///
/// The caller still owns the datagram's fds; the receiver gets duplicates.
pub fn send<P: AsRef<Path>>(path: P, datagram: &Datagram) -> Result<(), ProtocolError> {
    let path = path.as_ref();
    let payload = buffer::encode(datagram)?;
    let fds = datagram.raw_fds();
    let socket = UnixDatagram::unbound()?;
    let (addr, addr_len) = socket_addr(path)?;

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut c_void,
        iov_len: payload.len(),
    };
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_name = &addr as *const libc::sockaddr_un as *mut c_void;
    hdr.msg_namelen = addr_len;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;

    let mut control: Vec<u64> = Vec::new();
    if !fds.is_empty() {
        let data_len = (fds.len() * size_of::<RawFd>()) as u32;
        let control_len = unsafe { libc::CMSG_SPACE(data_len) } as usize;
        control.resize((control_len + 7) / 8, 0);
        hdr.msg_control = control.as_mut_ptr() as *mut c_void;
        hdr.msg_controllen = control_len as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;
            ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                data_len as usize,
            );
        }
    }

    let sent = loop {
        let result = unsafe { libc::sendmsg(socket.as_raw_fd(), &hdr, libc::MSG_NOSIGNAL) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            Err(err)?
        }
        break result as usize;
    };
    if sent != payload.len() {
        Err(ProtocolError::Truncated)?
    }
    log::trace!("sent {} to {:?}", datagram.command(), path);
    Ok(())
}

/// Create a close-on-exec pipe, returning the read and write ends
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}
