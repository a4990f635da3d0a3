//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::io::{ErrorKind, Write};
use std::os::unix::net::UnixStream;
use tether_core::{BackendKind, Runtime};

/// One runtime per backend compiled in for this platform
pub fn runtimes() -> Vec<Runtime> {
    BackendKind::available()
        .into_iter()
        .filter_map(|kind| match Runtime::builder().backend(kind).build() {
            Ok(rt) => Some(rt),
            // io_uring may be compiled in but disabled by the kernel
            Err(e) if kind == BackendKind::Uring => {
                eprintln!("skipping uring backend: {}", e);
                None
            }
            Err(e) => panic!("failed to build {} runtime: {}", kind, e),
        })
        .collect()
}

/// Connected nonblocking socket pair
pub fn socket_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

/// Write into `sock` until the kernel buffer is full
pub fn fill(sock: &UnixStream) {
    let chunk = [0u8; 16 * 1024];
    loop {
        match (&*sock).write(&chunk) {
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("fill failed: {}", e),
        }
    }
}
