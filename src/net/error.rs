//! Errors surfaced by server handles.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::net::address::SocketAddress;
use crate::tls::TlsError;

/// Errors that can occur while binding, updating or closing a server handle.
///
/// `Clone` so that every handle joining a physical listener can replay the
/// owner's bind outcome.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// The handle is already listening.
    #[error("listen already called on this server handle")]
    AlreadyListening,

    /// TLS was requested without any key/certificate or trust material.
    #[error("key/certificate is mandatory for SSL")]
    MissingCredentials,

    /// TLS context resolution failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The transport refused the bind.
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: SocketAddress,
        #[source]
        source: Arc<io::Error>,
    },

    /// The operation needs a bound handle.
    #[error("server handle is not listening")]
    NotListening,

    /// The physical listener was closed before the bind completed.
    #[error("server closed before the bind completed")]
    Closed,

    /// No Tokio runtime was available to host the handle's event loop.
    #[error("no Tokio runtime available for the server event loop")]
    NoRuntime,
}

impl ServerError {
    pub(crate) fn bind_failed(address: &SocketAddress, source: io::Error) -> Self {
        ServerError::BindFailed {
            address: address.clone(),
            source: Arc::new(source),
        }
    }
}
