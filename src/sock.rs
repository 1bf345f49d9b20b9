// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Stream-endpoint plumbing for connection setup, wakeup bytes and the
// socket transport: connect/listen/accept on a local name, full-frame
// send/recv with signal suppression, and peer credential extraction.
//
// On Linux the listening name lives in the abstract namespace (@name);
// elsewhere it is a filesystem socket under SOCKET_DIR with open
// permissions, since access control is credential-based.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sys;

pub(crate) const SERVER_BACKLOG: i32 = 5;

#[cfg(not(target_os = "linux"))]
pub(crate) const SOCKET_DIR: &str = "/var/run";

#[cfg(target_os = "linux")]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: i32 = 0;

/// Credentials of the peer on a connected stream, as reported by the
/// kernel — never by the peer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCreds {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    /// 0 where the platform cannot report the peer pid.
    pub pid: libc::pid_t,
}

fn new_stream_fd() -> Result<i32> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd == -1 {
        return Err(Error::last_os());
    }
    #[cfg(not(target_os = "linux"))]
    {
        // No MSG_NOSIGNAL here: suppress SIGPIPE at the socket level.
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                (&on as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    if let Err(e) = sys::fd_nonblock_cloexec(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

fn sock_addr(name: &str) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path_cap = addr.sun_path.len();

    #[cfg(target_os = "linux")]
    {
        // Abstract namespace: leading NUL, no filesystem presence.
        if name.len() + 1 >= path_cap {
            return Err(Error::Invalid);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                name.as_ptr(),
                addr.sun_path.as_mut_ptr().add(1).cast::<u8>(),
                name.len(),
            );
        }
        let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + 1 + name.len();
        Ok((addr, len as libc::socklen_t))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let path = format!("{SOCKET_DIR}/{name}");
        if path.len() >= path_cap {
            return Err(Error::Invalid);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                path.as_ptr(),
                addr.sun_path.as_mut_ptr().cast::<u8>(),
                path.len(),
            );
        }
        let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + path.len() + 1;
        Ok((addr, len as libc::socklen_t))
    }
}

/// Connect a fresh stream to the service published under `name`.
pub(crate) fn sock_connect(name: &str) -> Result<i32> {
    let fd = new_stream_fd()?;
    let (addr, len) = match sock_addr(name) {
        Ok(v) => v,
        Err(e) => {
            unsafe { libc::close(fd) };
            return Err(e);
        }
    };
    let res = unsafe { libc::connect(fd, (&addr as *const libc::sockaddr_un).cast(), len) };
    if res == -1 {
        let e = Error::last_os();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// Bind and listen on `name`, returning the listening fd.
pub(crate) fn sock_listen(name: &str) -> Result<i32> {
    let fd = new_stream_fd()?;
    let close_with = |e: Error| -> Error {
        unsafe { libc::close(fd) };
        e
    };
    let (addr, len) = sock_addr(name).map_err(close_with)?;

    log::info!("server name: {name}");

    #[cfg(not(target_os = "linux"))]
    {
        // Stale socket files block bind; access control is by peer
        // credentials, so the node itself is world-writable.
        let path = format!("{SOCKET_DIR}/{name}");
        sys::unlink_path(&path);
    }

    if unsafe { libc::bind(fd, (&addr as *const libc::sockaddr_un).cast(), len) } == -1 {
        let e = Error::last_os();
        log::error!("could not bind local socket ({name}): {e}");
        return Err(close_with(e));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let path = std::ffi::CString::new(format!("{SOCKET_DIR}/{name}"))
            .map_err(|_| Error::Invalid)?;
        unsafe { libc::chmod(path.as_ptr(), 0o777) };
    }

    if unsafe { libc::listen(fd, SERVER_BACKLOG) } == -1 {
        let e = Error::last_os();
        log::error!("listen failed: {e}");
    }
    Ok(fd)
}

/// Accept one pending stream; the returned fd is cloexec + nonblocking.
pub(crate) fn sock_accept(listen_fd: i32) -> Result<i32> {
    loop {
        let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd >= 0 {
            if let Err(e) = sys::fd_nonblock_cloexec(fd) {
                unsafe { libc::close(fd) };
                return Err(e);
            }
            return Ok(fd);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => continue,
            _ => return Err(Error::last_os()),
        }
    }
}

pub(crate) fn sock_close(fd: i32) {
    if fd < 0 {
        return;
    }
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
        libc::close(fd);
    }
}

fn remaining_ms(deadline: Option<Instant>) -> Result<i32> {
    match deadline {
        None => Ok(-1),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(Error::TimedOut);
            }
            Ok((d - now).as_millis().min(i32::MAX as u128) as i32)
        }
    }
}

fn deadline_of(timeout_ms: i32) -> Option<Instant> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    }
}

/// Block until `fd` is readable. `Again` on expiry, `ShutDown` on
/// HUP/ERR with nothing left to read.
pub(crate) fn recv_ready(fd: i32, timeout_ms: i32) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if n == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
        return Err(Error::Again);
    }
    if n == -1 {
        return Err(Error::last_os());
    }
    if n == 0 {
        return Err(Error::Again);
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 && pfd.revents & libc::POLLIN == 0 {
        return Err(Error::ShutDown);
    }
    Ok(())
}

/// Whether the peer has hung up (without consuming pending data).
pub(crate) fn hup_seen(fd: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 0) };
    n == 1 && pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
}

/// Send the whole of `buf`, retrying on EINTR and short writes and
/// waiting out EAGAIN. SIGPIPE is suppressed; a gone peer surfaces as
/// `ShutDown`.
pub(crate) fn send_all(fd: i32, buf: &[u8]) -> Result<usize> {
    let mut processed = 0usize;
    while processed < buf.len() {
        let res = unsafe {
            libc::send(
                fd,
                buf[processed..].as_ptr().cast(),
                buf.len() - processed,
                SEND_FLAGS,
            )
        };
        if res >= 0 {
            processed += res as usize;
            continue;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                let n = unsafe { libc::poll(&mut pfd, 1, -1) };
                if n == 1 && pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    return Err(Error::ShutDown);
                }
            }
            Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Err(Error::ShutDown),
            _ => return Err(Error::last_os()),
        }
    }
    Ok(processed)
}

/// Gathering variant of [`send_all`].
pub(crate) fn sendv_all(fd: i32, iov: &[&[u8]]) -> Result<usize> {
    let total: usize = iov.iter().map(|s| s.len()).sum();
    let mut processed = 0usize;
    while processed < total {
        // Rebuild the iovec view past what has been sent so far.
        let mut skip = processed;
        let mut vecs: Vec<libc::iovec> = Vec::with_capacity(iov.len());
        for seg in iov {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            vecs.push(libc::iovec {
                iov_base: seg[skip..].as_ptr() as *mut libc::c_void,
                iov_len: seg.len() - skip,
            });
            skip = 0;
        }
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = vecs.as_mut_ptr();
        msg.msg_iovlen = vecs.len() as _;

        let res = unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) };
        if res >= 0 {
            processed += res as usize;
            continue;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                let n = unsafe { libc::poll(&mut pfd, 1, -1) };
                if n == 1 && pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    return Err(Error::ShutDown);
                }
            }
            Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Err(Error::ShutDown),
            _ => return Err(Error::last_os()),
        }
    }
    Ok(processed)
}

/// Fill `buf` exactly, waiting for readability up to the deadline.
/// EOF mid-frame is `ShutDown`.
pub(crate) fn recv_all(fd: i32, buf: &mut [u8], timeout_ms: i32) -> Result<()> {
    let deadline = deadline_of(timeout_ms);
    let mut processed = 0usize;
    while processed < buf.len() {
        let res = unsafe {
            libc::recv(
                fd,
                buf[processed..].as_mut_ptr().cast(),
                buf.len() - processed,
                SEND_FLAGS,
            )
        };
        if res > 0 {
            processed += res as usize;
            continue;
        }
        if res == 0 {
            return Err(Error::ShutDown);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                let ms = remaining_ms(deadline).map_err(|_| {
                    if processed == 0 {
                        Error::Again
                    } else {
                        Error::TimedOut
                    }
                })?;
                match recv_ready(fd, ms) {
                    Ok(()) => {}
                    Err(Error::Again) if deadline.is_none() => {}
                    Err(Error::Again) => {
                        return Err(if processed == 0 {
                            Error::Again
                        } else {
                            Error::TimedOut
                        })
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => return Err(Error::last_os()),
        }
    }
    Ok(())
}

/// Receive one size-framed message into `buf`: header first, then the
/// remainder announced by `size`. Returns the frame length.
pub(crate) fn recv_frame(fd: i32, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
    use crate::proto::{self, RequestHeader};

    if buf.len() < proto::REQ_HEADER_SIZE {
        return Err(Error::NoBufs);
    }
    let deadline = deadline_of(timeout_ms);
    recv_ready(fd, timeout_ms)?;
    let left = |d| remaining_ms(d).unwrap_or(0);
    let (head, _) = buf.split_at_mut(proto::REQ_HEADER_SIZE);
    recv_all(fd, head, left(deadline))?;
    let hdr = RequestHeader::from_bytes(head)?;
    let size = proto::check_request_size(&hdr, buf.len())?;
    if size > proto::REQ_HEADER_SIZE {
        let rest = &mut buf[proto::REQ_HEADER_SIZE..size];
        recv_all(fd, rest, left(deadline))?;
    }
    Ok(size)
}

/// One wakeup byte on the paired stream: makes a poll-based peer
/// return from poll when transport data lands outside its fd set.
pub(crate) fn wakeup_send(fd: i32) -> Result<()> {
    send_all(fd, &[0u8]).map(|_| ())
}

/// Drain up to `n` wakeup bytes; short or empty reads are fine.
pub(crate) fn wakeup_drain(fd: i32, n: usize) {
    if n == 0 {
        return;
    }
    let mut buf = [0u8; 16];
    let mut left = n;
    while left > 0 {
        let take = left.min(buf.len());
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), take, SEND_FLAGS) };
        if res <= 0 {
            return;
        }
        left -= res as usize;
    }
}

/// Read the 8-byte header of the first frame on a fresh stream along
/// with the kernel-supplied peer credentials, then the frame body.
/// Returns the whole frame and the credentials.
pub(crate) fn recv_setup_frame(fd: i32, timeout_ms: i32) -> Result<(Vec<u8>, PeerCreds)> {
    use crate::proto::{self, RequestHeader};

    let deadline = deadline_of(timeout_ms);
    recv_ready(fd, timeout_ms)?;

    let mut head = [0u8; proto::REQ_HEADER_SIZE];
    let creds = recv_with_creds(fd, &mut head, remaining_ms(deadline).unwrap_or(0))?;

    let hdr = RequestHeader::from_bytes(&head)?;
    // Setup frames are tiny; anything bigger is malformed.
    let size = proto::check_request_size(&hdr, 4096)?;
    let mut frame = vec![0u8; size];
    frame[..proto::REQ_HEADER_SIZE].copy_from_slice(&head);
    if size > proto::REQ_HEADER_SIZE {
        recv_all(
            fd,
            &mut frame[proto::REQ_HEADER_SIZE..],
            remaining_ms(deadline).unwrap_or(0),
        )?;
    }
    Ok((frame, creds))
}

#[cfg(target_os = "linux")]
fn recv_with_creds(fd: i32, buf: &mut [u8], timeout_ms: i32) -> Result<PeerCreds> {
    let on: libc::c_int = 1;
    let off: libc::c_int = 0;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let res = recv_msghdr_with_creds(fd, buf, timeout_ms);

    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&off as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    res
}

#[cfg(target_os = "linux")]
fn recv_msghdr_with_creds(fd: i32, buf: &mut [u8], timeout_ms: i32) -> Result<PeerCreds> {
    let deadline = deadline_of(timeout_ms);
    // Comfortably holds CMSG_SPACE(sizeof(ucred)).
    let mut cmsg_buf = [0u8; 64];
    let mut processed = 0usize;
    let mut creds: Option<PeerCreds> = None;

    while processed < buf.len() {
        let mut iov = libc::iovec {
            iov_base: buf[processed..].as_mut_ptr().cast(),
            iov_len: buf.len() - processed,
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_buf.len() as _;

        let res = unsafe { libc::recvmsg(fd, &mut msg, SEND_FLAGS) };
        if res > 0 {
            if creds.is_none() {
                let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
                if !cmsg.is_null() {
                    let c = unsafe { &*cmsg };
                    if c.cmsg_level == libc::SOL_SOCKET && c.cmsg_type == libc::SCM_CREDENTIALS {
                        let ucred =
                            unsafe { (libc::CMSG_DATA(cmsg) as *const libc::ucred).read_unaligned() };
                        creds = Some(PeerCreds {
                            uid: ucred.uid,
                            gid: ucred.gid,
                            pid: ucred.pid,
                        });
                    }
                }
            }
            processed += res as usize;
            continue;
        }
        if res == 0 {
            return Err(Error::ShutDown);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                let ms = remaining_ms(deadline)?;
                recv_ready(fd, ms)?;
            }
            _ => return Err(Error::last_os()),
        }
    }
    creds.ok_or(Error::Invalid)
}

#[cfg(not(target_os = "linux"))]
fn recv_with_creds(fd: i32, buf: &mut [u8], timeout_ms: i32) -> Result<PeerCreds> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    if unsafe { libc::getpeereid(fd, &mut uid, &mut gid) } != 0 {
        return Err(Error::last_os());
    }
    recv_all(fd, buf, timeout_ms)?;
    Ok(PeerCreds { uid, gid, pid: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let r = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(r, 0);
        sys::fd_nonblock_cloexec(fds[0]).unwrap();
        sys::fd_nonblock_cloexec(fds[1]).unwrap();
        (fds[0], fds[1])
    }

    #[test]
    fn send_recv_roundtrip() {
        let (a, b) = pair();
        assert_eq!(send_all(a, b"hello world").unwrap(), 11);
        let mut buf = [0u8; 11];
        recv_all(b, &mut buf, 1000).unwrap();
        assert_eq!(&buf, b"hello world");
        sock_close(a);
        sock_close(b);
    }

    #[test]
    fn sendv_gathers() {
        let (a, b) = pair();
        assert_eq!(sendv_all(a, &[b"foo", b"", b"barbaz"]).unwrap(), 9);
        let mut buf = [0u8; 9];
        recv_all(b, &mut buf, 1000).unwrap();
        assert_eq!(&buf, b"foobarbaz");
        sock_close(a);
        sock_close(b);
    }

    #[test]
    fn recv_times_out() {
        let (a, b) = pair();
        let mut buf = [0u8; 4];
        assert!(matches!(
            recv_all(b, &mut buf, 50),
            Err(Error::Again) | Err(Error::TimedOut)
        ));
        sock_close(a);
        sock_close(b);
    }

    #[test]
    fn eof_is_shutdown() {
        let (a, b) = pair();
        sock_close(a);
        let mut buf = [0u8; 4];
        assert!(matches!(recv_all(b, &mut buf, 100), Err(Error::ShutDown)));
        sock_close(b);
    }

    #[test]
    fn wakeup_bytes_drain() {
        let (a, b) = pair();
        for _ in 0..3 {
            wakeup_send(a).unwrap();
        }
        wakeup_drain(b, 3);
        let mut probe = [0u8; 1];
        let res = unsafe { libc::recv(b, probe.as_mut_ptr().cast(), 1, 0) };
        assert_eq!(res, -1); // nothing left
        sock_close(a);
        sock_close(b);
    }
}
