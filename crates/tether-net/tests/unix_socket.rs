//! Integration tests for Unix sockets on the tether runtime

use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use tether_core::testing::wait_all_tasks_blocked;
use tether_core::{current_statistics, spawn, BackendKind, CancelScope, Runtime};
use tether_net::{Error, UnixListener, UnixStream};

fn runtimes() -> Vec<Runtime> {
    BackendKind::available()
        .into_iter()
        .filter_map(|kind| Runtime::builder().backend(kind).build().ok())
        .collect()
}

#[test]
fn test_echo_over_listener() {
    for mut rt in runtimes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");

        let reply = rt
            .block_on(async move {
                let listener = UnixListener::bind(&path)?;
                let server = spawn(async move {
                    let conn = listener.accept().await?;
                    let mut buf = [0u8; 64];
                    let n = conn.read(&mut buf).await?;
                    conn.write_all(&buf[..n]).await?;
                    Ok::<_, Error>(())
                })?;

                let client = UnixStream::connect(&path).await?;
                client.write_all(b"hello").await?;
                let mut buf = [0u8; 64];
                let n = client.read(&mut buf).await?;
                server.join().await??;
                Ok::<_, Error>(buf[..n].to_vec())
            })
            .unwrap()
            .unwrap();

        assert_eq!(reply, b"hello");
    }
}

#[test]
fn test_large_transfer_through_pair() {
    const TOTAL: usize = 1 << 20;

    for mut rt in runtimes() {
        let received = rt
            .block_on(async {
                let (tx, rx) = UnixStream::pair()?;
                let writer = spawn(async move {
                    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
                    tx.write_all(&payload).await?;
                    tx.shutdown_write()?;
                    Ok::<_, Error>(())
                })?;

                let mut received = Vec::with_capacity(TOTAL);
                let mut buf = [0u8; 8192];
                loop {
                    let n = rx.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    received.extend_from_slice(&buf[..n]);
                }
                writer.join().await??;
                Ok::<_, Error>(received)
            })
            .unwrap()
            .unwrap();

        assert_eq!(received.len(), TOTAL);
        assert!(received.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
    }
}

#[test]
fn test_peer_drop_reads_end_of_stream() {
    let mut rt = Runtime::builder().backend(BackendKind::Poll).build().unwrap();

    let n = rt
        .block_on(async {
            let (a, b) = UnixStream::pair()?;
            let reader = spawn(async move {
                let mut buf = [0u8; 16];
                b.read(&mut buf).await
            })?;
            wait_all_tasks_blocked().await?;
            drop(a);
            reader.join().await?
        })
        .unwrap()
        .unwrap();

    assert_eq!(n, 0);
}

#[test]
fn test_close_wakes_reader_of_shared_socket() {
    let mut rt = Runtime::builder().backend(BackendKind::Poll).build().unwrap();

    let result = rt
        .block_on(async {
            let (a, _b) = UnixStream::pair()?;
            let a = Rc::new(a);
            let fd = a.as_raw_fd();
            let reader = spawn({
                let a = a.clone();
                async move {
                    let mut buf = [0u8; 16];
                    a.read(&mut buf).await
                }
            })?;
            wait_all_tasks_blocked().await?;
            tether_core::notify_closing(fd)?;
            let result = reader.join().await?;
            let stats = current_statistics()?;
            assert_eq!(stats.io.tasks_waiting_read, 0);
            Ok::<_, Error>(result.map_err(|e| (e, fd)))
        })
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err((Error::DescriptorClosed { fd }, expected)) if fd == expected));
}

#[test]
fn test_close_outside_runtime() {
    let (a, b) = UnixStream::pair().unwrap();
    a.close().unwrap();
    drop(b);
}

#[test]
fn test_connect_missing_path_fails() {
    let mut rt = Runtime::builder().backend(BackendKind::Poll).build().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.sock");

    let result = rt.block_on(async move { UnixStream::connect(&path).await.map(|_| ()) }).unwrap();

    assert!(matches!(result, Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound));
    assert_eq!(rt.statistics().io.registrations, 0);
}

#[test]
fn test_accept_cancelled() {
    let mut rt = Runtime::builder().backend(BackendKind::Poll).build().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idle.sock");

    let accepted = rt
        .block_on(async move {
            let listener = UnixListener::bind(&path)?;
            let scope = CancelScope::new();
            let acceptor = spawn({
                let scope = scope.clone();
                async move { scope.run(listener.accept()).await.map(|conn| conn.is_some()) }
            })?;
            wait_all_tasks_blocked().await?;
            scope.cancel();
            acceptor.join().await?
        })
        .unwrap()
        .unwrap();

    assert!(!accepted);
}
