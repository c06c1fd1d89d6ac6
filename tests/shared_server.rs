//! Shared listener behavior across logical server handles.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use portshare::config::ServerOptions;
use portshare::lifecycle::Shutdown;
use portshare::net::{ServerError, SocketAddress, TcpServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

fn localhost(port: i32) -> SocketAddress {
    SocketAddress::inet("127.0.0.1", port)
}

#[tokio::test]
async fn two_handles_share_one_socket_round_robin() {
    let registry = common::registry();
    let port = common::free_port();
    let a = common::tagged(&registry, "A", ServerOptions::default());
    let b = common::tagged(&registry, "B", ServerOptions::default());

    a.bind(&localhost(i32::from(port))).await.unwrap();
    b.bind(&localhost(i32::from(port))).await.unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(a.actual_port(), Some(port));
    assert_eq!(b.actual_port(), Some(port));

    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..4 {
        *seen.entry(common::read_tag(port).await).or_default() += 1;
    }
    assert_eq!(seen.get("A"), Some(&2));
    assert_eq!(seen.get("B"), Some(&2));

    // The socket stays open while B is attached.
    a.close().await;
    assert!(!a.is_listening());
    assert_eq!(registry.len(), 1);
    for _ in 0..2 {
        assert_eq!(common::read_tag(port).await, "B");
    }

    b.close().await;
    assert!(registry.is_empty());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // A fresh owner can take the port again.
    let c = common::tagged(&registry, "C", ServerOptions::default());
    c.bind(&localhost(i32::from(port))).await.unwrap();
    assert_eq!(common::read_tag(port).await, "C");
    c.close().await;
}

#[tokio::test]
async fn concurrent_binds_share_one_physical_bind() {
    let registry = common::registry();
    let port = i32::from(common::free_port());
    let handles: Vec<TcpServer> = (0..8)
        .map(|_| common::echo(&registry, ServerOptions::default()))
        .collect();

    let address = localhost(port);
    let results = join_all(handles.iter().map(|h| h.bind(&address))).await;
    let addresses: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(registry.len(), 1);

    let owners: Vec<_> = handles.iter().map(|h| h.shared().unwrap().owner()).collect();
    assert!(owners.iter().all(|o| *o == owners[0]));
    assert_eq!(handles[0].shared().unwrap().handles().len(), 8);

    join_all(handles.iter().map(TcpServer::close)).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn bind_failure_is_replayed_to_every_joiner() {
    let registry = common::registry();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = i32::from(occupied.local_addr().unwrap().port());
    let handles: Vec<TcpServer> = (0..4)
        .map(|_| common::echo(&registry, ServerOptions::default()))
        .collect();

    let address = localhost(port);
    let results = join_all(handles.iter().map(|h| h.bind(&address))).await;
    for result in results {
        assert!(matches!(result, Err(ServerError::BindFailed { .. })));
    }
    assert!(registry.is_empty());
    assert!(handles.iter().all(|h| !h.is_listening()));

    // A failed handle may bind again.
    drop(occupied);
    handles[0].bind(&localhost(port)).await.unwrap();
    assert!(handles[0].is_listening());
    handles[0].close().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn port_zero_is_never_shared() {
    let registry = common::registry();
    let a = common::echo(&registry, ServerOptions::default());
    let b = common::echo(&registry, ServerOptions::default());

    a.bind(&localhost(0)).await.unwrap();
    b.bind(&localhost(0)).await.unwrap();
    assert!(registry.is_empty());
    assert_ne!(a.actual_port(), b.actual_port());
    assert_ne!(a.actual_port(), Some(0));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn negative_ports_group_ephemeral_listeners() {
    let registry = common::registry();
    let first = common::echo(&registry, ServerOptions::default());
    let second = common::echo(&registry, ServerOptions::default());
    let other = common::echo(&registry, ServerOptions::default());

    first.bind(&localhost(-1)).await.unwrap();
    second.bind(&localhost(-1)).await.unwrap();
    other.bind(&localhost(-2)).await.unwrap();

    let port = first.actual_port().unwrap();
    assert_ne!(port, 0);
    assert_eq!(second.actual_port(), Some(port));
    assert_ne!(other.actual_port(), Some(port));
    assert_eq!(registry.len(), 2);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_eq!(common::echo_roundtrip(&mut stream, b"group").await, b"group");

    for handle in [&first, &second, &other] {
        handle.close().await;
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn connection_limit_applies_backpressure() {
    let registry = common::registry();
    let options = ServerOptions {
        max_connections: 1,
        ..Default::default()
    };
    let server = common::echo(&registry, options);
    server.bind(&localhost(0)).await.unwrap();
    let port = server.actual_port().unwrap();

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_eq!(common::echo_roundtrip(&mut first, b"one").await, b"one");
    assert_eq!(server.active_connections(), 1);

    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    second.write_all(b"two").await.unwrap();
    let mut buf = [0u8; 3];
    let stalled = tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut buf)).await;
    assert!(stalled.is_err());

    drop(first);
    tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"two");
    server.close().await;
}

#[tokio::test]
async fn close_hooks_cover_unclosed_handles() {
    let registry = common::registry();
    let shutdown = Shutdown::new();
    let port = i32::from(common::free_port());
    let build = || {
        TcpServer::builder(registry.clone(), portshare::net::StreamHandler::echo())
            .shutdown(shutdown.clone())
            .build()
    };
    let a = build();
    let b = build();

    a.bind(&localhost(port)).await.unwrap();
    b.bind(&localhost(port)).await.unwrap();
    assert_eq!(shutdown.hook_count(), 2);

    a.close().await;
    assert_eq!(shutdown.hook_count(), 1);

    shutdown.close_all().await;
    assert_eq!(shutdown.hook_count(), 0);
    assert!(!b.is_listening());
    assert!(registry.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn domain_socket_is_shared_and_unlinked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("portshare.sock");
    let address = SocketAddress::domain_socket(&path);

    let registry = common::registry();
    let a = common::echo(&registry, ServerOptions::default());
    let b = common::echo(&registry, ServerOptions::default());
    a.bind(&address).await.unwrap();
    b.bind(&address).await.unwrap();
    assert_eq!(registry.len(), 1);

    let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    assert_eq!(common::echo_roundtrip(&mut stream, b"unix").await, b"unix");

    a.close().await;
    assert!(path.exists());
    b.close().await;
    assert!(!path.exists());
    assert!(registry.is_empty());
}
