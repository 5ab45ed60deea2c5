//! Descriptor transfer over a connected Unix socket (`SCM_RIGHTS`).
//!
//! Used to move a PTY master from the runtime to the console consumer when
//! both share a local socket. Each exchange carries one payload byte and one
//! control message holding exactly one descriptor. Anything else means the
//! channel is corrupt, and the receiver fails closed.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::{Error, Result};

/// Room for this many descriptors is reserved on receive, so that a sender
/// passing more than one is detected instead of silently truncated.
const RECV_FDS: usize = 8;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Sends one open descriptor across `conn`.
pub async fn send_fd(conn: &UnixStream, fd: BorrowedFd<'_>) -> io::Result<()> {
    send_fds(conn, &[fd]).await
}

/// Sends several descriptors in a single control message.
pub(crate) async fn send_fds(conn: &UnixStream, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    conn.async_io(Interest::WRITABLE, || sendmsg_fds(conn.as_raw_fd(), &raw))
        .await
}

/// Receives exactly one descriptor from `conn`.
///
/// Fails with [`Error::Protocol`] unless the message carried exactly one
/// `SCM_RIGHTS` control message with exactly one descriptor. Descriptors
/// from a rejected message are closed.
pub async fn recv_fd(conn: &UnixStream) -> Result<OwnedFd> {
    let received = conn
        .async_io(Interest::READABLE, || recvmsg_fds(conn.as_raw_fd()))
        .await?;
    received.into_single()
}

/// Everything observed in one `recvmsg` call.
#[derive(Debug)]
struct Received {
    bytes: usize,
    messages: usize,
    foreign: usize,
    truncated: bool,
    fds: Vec<OwnedFd>,
}

impl Received {
    fn into_single(self) -> Result<OwnedFd> {
        if self.truncated {
            return Err(Error::Protocol(
                "descriptor message was truncated".to_owned(),
            ));
        }
        if self.bytes == 0 && self.messages == 0 {
            return Err(Error::Protocol(
                "peer closed before sending a descriptor".to_owned(),
            ));
        }
        if self.messages != 1 || self.foreign != 0 {
            return Err(Error::Protocol(format!(
                "expected one SCM_RIGHTS control message, got {} ({} foreign)",
                self.messages, self.foreign
            )));
        }
        match <[OwnedFd; 1]>::try_from(self.fds) {
            Ok([fd]) => Ok(fd),
            Err(fds) => Err(Error::Protocol(format!(
                "expected one descriptor, got {}",
                fds.len()
            ))),
        }
    }
}

/// Control buffer with `cmsghdr` alignment.
fn control_buffer(fds: usize) -> (Vec<u64>, usize) {
    let data_len = u32::try_from(fds * mem::size_of::<RawFd>()).unwrap_or(u32::MAX);
    // SAFETY: CMSG_SPACE only computes a size.
    let space = unsafe { libc::CMSG_SPACE(data_len) } as usize;
    (vec![0u64; space.div_ceil(mem::size_of::<u64>())], space)
}

fn sendmsg_fds(sock: RawFd, fds: &[RawFd]) -> io::Result<()> {
    let payload = [0u8; 1];
    let mut iov = [libc::iovec {
        iov_base: payload.as_ptr().cast_mut().cast(),
        iov_len: payload.len(),
    }];
    let (mut control, space) = control_buffer(fds.len());

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = 1;
    if !fds.is_empty() {
        let data_len = mem::size_of_val(fds);
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
        // SAFETY: the control buffer holds CMSG_SPACE(data_len) aligned bytes,
        // so the first header and its data area are in bounds.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr().cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                data_len,
            );
        }
    }

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::sendmsg(sock, &msg, SEND_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recvmsg_fds(sock: RawFd) -> io::Result<Received> {
    let mut payload = [0u8; 1];
    let mut iov = [libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    }];
    let (mut control, space) = control_buffer(RECV_FDS);

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::recvmsg(sock, &mut msg, RECV_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut received = Received {
        bytes: n.unsigned_abs(),
        messages: 0,
        foreign: 0,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
        fds: Vec::new(),
    };

    // SAFETY: the kernel filled `control` with well-formed headers up to
    // msg_controllen; CMSG_NXTHDR stops at its end. Every SCM_RIGHTS entry
    // is a fresh descriptor we now own.
    unsafe {
        let header = libc::CMSG_LEN(0) as usize;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            received.messages += 1;
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header)
                    / mem::size_of::<RawFd>();
                for i in 0..count {
                    let fd = data
                        .add(i * mem::size_of::<RawFd>())
                        .cast::<RawFd>()
                        .read_unaligned();
                    received.fds.push(OwnedFd::from_raw_fd(fd));
                }
            } else {
                received.foreign += 1;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok(received)
}
