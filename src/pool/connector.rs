//! Connection establishment for pooled endpoints.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::net::address::SocketAddress;
use crate::net::connection::BoxStream;
use crate::pool::key::EndpointKey;
use crate::pool::PoolError;

/// Opens new connections for an endpoint.
pub trait Connector<C>: Send + Sync + 'static {
    fn connect(&self, key: &EndpointKey) -> BoxFuture<'static, Result<C, PoolError>>;
}

/// Plain TCP or domain socket connector, with client TLS for `ssl` keys.
///
/// When the key carries a proxy the socket is opened to the proxy; any proxy
/// protocol exchange is left to the caller.
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }
}

impl Connector<BoxStream> for TcpConnector {
    fn connect(&self, key: &EndpointKey) -> BoxFuture<'static, Result<BoxStream, PoolError>> {
        let target = key
            .proxy()
            .map(|proxy| proxy.address())
            .unwrap_or_else(|| key.server().clone());
        let tls = if key.ssl() {
            Some((self.tls.clone(), key.authority().host.clone()))
        } else {
            None
        };

        Box::pin(async move {
            let stream = open(&target).await?;
            let Some((config, host)) = tls else {
                return Ok(stream);
            };
            let config = config.ok_or_else(|| PoolError::Connect("no client TLS configuration".into()))?;
            let server_name = ServerName::try_from(host).map_err(|e| PoolError::Connect(e.to_string()))?;
            let tls_stream = TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(|e| PoolError::Connect(e.to_string()))?;
            Ok(Box::new(tls_stream) as BoxStream)
        })
    }
}

async fn open(target: &SocketAddress) -> Result<BoxStream, PoolError> {
    let fail = |e: std::io::Error| PoolError::Connect(format!("{target}: {e}"));
    match target {
        SocketAddress::Inet { host, port } => {
            let port = u16::try_from(*port).map_err(|_| PoolError::Connect(format!("{target}: invalid port")))?;
            let stream = TcpStream::connect((host.as_str(), port)).await.map_err(fail)?;
            stream.set_nodelay(true).map_err(fail)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        SocketAddress::DomainSocket { path } => {
            let stream = tokio::net::UnixStream::connect(path).await.map_err(fail)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        SocketAddress::DomainSocket { .. } => Err(PoolError::Connect(format!("{target}: domain sockets unsupported"))),
    }
}
