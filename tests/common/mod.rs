//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use portshare::config::{KeyCertOptions, PemSource, ServerOptions, TlsOptions, TrustOptions};
use portshare::net::{ServerRegistry, StreamHandler, TcpServer};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn server_tls(alpn: &[&str]) -> TlsOptions {
    TlsOptions {
        key_certs: vec![KeyCertOptions {
            cert: PemSource::Path(fixture("server.crt")),
            key: PemSource::Path(fixture("server.key")),
            server_name: None,
        }],
        alpn_protocols: alpn.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    }
}

pub fn server_tls_with_trust(alpn: &[&str]) -> TlsOptions {
    TlsOptions {
        trust: Some(TrustOptions {
            ca: PemSource::Path(fixture("ca.crt")),
        }),
        ..server_tls(alpn)
    }
}

pub fn ssl_options(tls: TlsOptions) -> ServerOptions {
    ServerOptions {
        ssl: true,
        tls,
        ..Default::default()
    }
}

pub fn registry() -> Arc<ServerRegistry> {
    Arc::new(ServerRegistry::new())
}

/// Handle whose connections receive `tag` and are then closed.
pub fn tagged(registry: &Arc<ServerRegistry>, tag: &'static str, options: ServerOptions) -> TcpServer {
    let handler = StreamHandler::new(move |mut socket| async move {
        let _ = socket.write_all(tag.as_bytes()).await;
        let _ = socket.shutdown().await;
    });
    TcpServer::builder(Arc::clone(registry), handler).options(options).build()
}

pub fn echo(registry: &Arc<ServerRegistry>, options: ServerOptions) -> TcpServer {
    TcpServer::builder(Arc::clone(registry), StreamHandler::echo())
        .options(options)
        .build()
}

/// Connect and read everything the server sends before closing.
pub async fn read_tag(port: u16) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut tag = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut tag))
        .await
        .unwrap()
        .unwrap();
    tag
}

pub fn client_config(alpn: &[&str], with_client_cert: bool) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let mut ca = BufReader::new(File::open(fixture("ca.crt")).unwrap());
    for cert in rustls_pemfile::certs(&mut ca) {
        roots.add(cert.unwrap()).unwrap();
    }

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);

    let mut config = if with_client_cert {
        let mut cert = BufReader::new(File::open(fixture("client.crt")).unwrap());
        let chain = rustls_pemfile::certs(&mut cert).collect::<Result<Vec<_>, _>>().unwrap();
        let mut key = BufReader::new(File::open(fixture("client.key")).unwrap());
        let key = rustls_pemfile::private_key(&mut key).unwrap().unwrap();
        builder.with_client_auth_cert(chain, key).unwrap()
    } else {
        builder.with_no_client_auth()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Arc::new(config)
}

pub async fn tls_connect(port: u16, config: Arc<rustls::ClientConfig>) -> std::io::Result<TlsStream<TcpStream>> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let name = ServerName::try_from("localhost").unwrap();
    TlsConnector::from(config).connect(name, stream).await
}

/// Negotiated ALPN protocol of a fresh TLS connection.
pub async fn negotiated_alpn(port: u16, offered: &[&str]) -> Option<String> {
    let stream = tls_connect(port, client_config(offered, false)).await.unwrap();
    stream
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned())
}

pub async fn echo_roundtrip<S>(stream: &mut S, message: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}
