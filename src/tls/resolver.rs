//! TLS context resolution.
//!
//! # Responsibilities
//! - Load key/certificate and trust material (files or inline PEM)
//! - Build a `rustls::ServerConfig` with client auth, SNI and ALPN
//!
//! # Design Decisions
//! - Files are read at resolution time so a reload picks up rotated material
//! - With SNI enabled a client without a matching name gets the first pair

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::{ClientAuth, PemSource, TlsOptions, TrustOptions};
use crate::tls::TlsError;

/// A resolved, immutable TLS server context.
pub struct TlsContext {
    config: Arc<ServerConfig>,
    options: TlsOptions,
}

impl TlsContext {
    pub fn new(config: Arc<ServerConfig>, options: TlsOptions) -> Self {
        Self { config, options }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// The options this context was built from.
    pub fn options(&self) -> &TlsOptions {
        &self.options
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("alpn_protocols", &self.options.alpn_protocols)
            .field("sni", &self.options.sni)
            .field("client_auth", &self.options.client_auth)
            .finish_non_exhaustive()
    }
}

/// Turns TLS options into a usable context.
pub trait TlsResolver: Send + Sync + 'static {
    fn resolve(&self, options: TlsOptions) -> BoxFuture<'static, Result<TlsContext, TlsError>>;
}

/// Default resolver backed by rustls with the aws-lc-rs provider.
#[derive(Debug, Clone)]
pub struct RustlsResolver {
    provider: Arc<CryptoProvider>,
}

impl RustlsResolver {
    pub fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl Default for RustlsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsResolver for RustlsResolver {
    fn resolve(&self, options: TlsOptions) -> BoxFuture<'static, Result<TlsContext, TlsError>> {
        let provider = Arc::clone(&self.provider);
        Box::pin(async move {
            let config = build_server_config(&provider, &options).await?;
            Ok(TlsContext::new(Arc::new(config), options))
        })
    }
}

async fn build_server_config(provider: &Arc<CryptoProvider>, options: &TlsOptions) -> Result<ServerConfig, TlsError> {
    if options.key_certs.is_empty() {
        return Err(TlsError::InvalidCredentials("no key/certificate pair configured".into()));
    }

    let builder = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::ResolutionFailed(e.to_string()))?;

    let builder = match options.client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        ClientAuth::Request | ClientAuth::Required => {
            let trust = options.trust.as_ref().ok_or_else(|| {
                TlsError::InvalidCredentials("client authentication requires trust options".into())
            })?;
            let roots = load_roots(trust).await?;
            let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider));
            if options.client_auth == ClientAuth::Request {
                verifier = verifier.allow_unauthenticated();
            }
            let verifier = verifier
                .build()
                .map_err(|e| TlsError::ResolutionFailed(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut default = None;
    let mut by_name = HashMap::new();
    for pair in &options.key_certs {
        let certs = parse_certs(&read_pem(&pair.cert).await?)?;
        let key = parse_key(&read_pem(&pair.key).await?)?;
        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| TlsError::InvalidCredentials(e.to_string()))?;
        let certified = Arc::new(CertifiedKey::new(certs, signing_key));

        if options.sni {
            if let Some(name) = &pair.server_name {
                by_name.insert(name.to_ascii_lowercase(), Arc::clone(&certified));
            }
        }
        default.get_or_insert(certified);
    }
    let default = default.ok_or_else(|| TlsError::InvalidCredentials("no key/certificate pair configured".into()))?;

    let mut config = builder.with_cert_resolver(Arc::new(CertSelector { default, by_name }));
    config.alpn_protocols = options
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    Ok(config)
}

/// Picks the certified key for a handshake by SNI name.
#[derive(Debug)]
struct CertSelector {
    default: Arc<CertifiedKey>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl ResolvesServerCert for CertSelector {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let selected = hello
            .server_name()
            .and_then(|name| self.by_name.get(&name.to_ascii_lowercase()))
            .unwrap_or(&self.default);
        Some(Arc::clone(selected))
    }
}

async fn read_pem(source: &PemSource) -> Result<Vec<u8>, TlsError> {
    match source {
        PemSource::Path(path) => tokio::fs::read(path)
            .await
            .map_err(|e| TlsError::InvalidCredentials(format!("{}: {}", path.display(), e))),
        PemSource::Inline(pem) => Ok(pem.as_bytes().to_vec()),
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCredentials(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::InvalidCredentials("no certificate found in PEM".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TlsError::InvalidCredentials(e.to_string()))?
        .ok_or_else(|| TlsError::InvalidCredentials("no private key found in PEM".into()))
}

async fn load_roots(trust: &TrustOptions) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(&read_pem(&trust.ca).await?)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::InvalidCredentials(e.to_string()))?;
    }
    Ok(roots)
}
