//! Raw socket calls std does not expose in non-blocking form

use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net;
use std::path::Path;

/// Filesystem socket address
pub(crate) struct SocketAddr {
    raw: libc::sockaddr_un,
    len: libc::socklen_t,
}

impl SocketAddr {
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let bytes = path.as_os_str().as_bytes();
        // SAFETY: sockaddr_un is plain old data; all-zero is a valid value
        let mut raw: libc::sockaddr_un = unsafe { mem::zeroed() };
        raw.sun_family = libc::AF_UNIX as libc::sa_family_t;

        if bytes.contains(&0) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path contains a nul byte"));
        }
        // Keep room for the terminating nul
        if bytes.len() >= raw.sun_path.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path is too long"));
        }
        for (dst, src) in raw.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        let offset = mem::offset_of!(libc::sockaddr_un, sun_path);
        let len = (offset + bytes.len() + 1) as libc::socklen_t;
        Ok(Self { raw, len })
    }
}

/// New close-on-exec, non-blocking stream socket
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) fn stream_socket() -> io::Result<net::UnixStream> {
    let ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK;
    // SAFETY: plain syscall; the result is checked before use
    let fd = unsafe { libc::socket(libc::AF_UNIX, ty, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just created and nothing else owns it
    Ok(net::UnixStream::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// New close-on-exec, non-blocking stream socket.
///
/// No atomic flags here, so there is a window in which a concurrent exec
/// inherits the descriptor.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub(crate) fn stream_socket() -> io::Result<net::UnixStream> {
    // SAFETY: plain syscall; the result is checked before use
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just created and nothing else owns it
    let socket = net::UnixStream::from(unsafe { OwnedFd::from_raw_fd(fd) });

    // SAFETY: fcntl on a descriptor we own
    if unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Start a connect. `Ok(false)` means it is in progress.
pub(crate) fn start_connect(socket: &net::UnixStream, addr: &SocketAddr) -> io::Result<bool> {
    // SAFETY: addr.raw outlives the call and addr.len does not exceed its size
    let rc = unsafe {
        libc::connect(
            socket.as_raw_fd(),
            &addr.raw as *const libc::sockaddr_un as *const libc::sockaddr,
            addr.len,
        )
    };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok(false),
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr_length() {
        let addr = SocketAddr::from_path(Path::new("/tmp/a.sock")).unwrap();
        let offset = mem::offset_of!(libc::sockaddr_un, sun_path);
        assert_eq!(addr.len as usize, offset + "/tmp/a.sock".len() + 1);
        assert_eq!(addr.raw.sun_path[0], b'/' as libc::c_char);
    }

    #[test]
    fn test_socket_addr_rejects_bad_paths() {
        let long = "x".repeat(200);
        assert!(SocketAddr::from_path(Path::new(&long)).is_err());
        assert!(SocketAddr::from_path(Path::new("a\0b")).is_err());
    }

    #[test]
    fn test_stream_socket_flags() {
        let socket = stream_socket().unwrap();
        // SAFETY: querying flags of an open descriptor
        let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        // SAFETY: as above
        let fd_flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFD) };
        assert!(fd_flags & libc::FD_CLOEXEC != 0);
    }
}
