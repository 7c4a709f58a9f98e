//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{ClientTlsConfig, TlsConfig};
use crate::error::TransportError;
use crate::net::io::BoxedIo;

/// A loaded TLS context ready to wrap streams on one side of a connection.
#[derive(Clone)]
pub enum TlsContext {
    Server(TlsAcceptor),
    Client(TlsConnector),
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsContext::Server(_) => f.write_str("TlsContext::Server"),
            TlsContext::Client(_) => f.write_str("TlsContext::Client"),
        }
    }
}

impl TlsContext {
    /// Build a server context from certificate and key files.
    pub fn server(config: &TlsConfig) -> Result<Self, TransportError> {
        Ok(TlsContext::Server(TlsAcceptor::from(load_server_config(config)?)))
    }

    /// Build a client context, trusting either the configured store or the platform roots.
    pub fn client(config: Option<&ClientTlsConfig>) -> Result<Self, TransportError> {
        let default = ClientTlsConfig::default();
        let config = config.unwrap_or(&default);
        Ok(TlsContext::Client(TlsConnector::from(load_client_config(config)?)))
    }

    /// Run the handshake over `io`. `server_name` is required on the client side.
    pub async fn wrap(&self, io: BoxedIo, server_name: Option<&str>) -> Result<BoxedIo, TransportError> {
        match self {
            TlsContext::Server(acceptor) => {
                let stream = acceptor
                    .accept(io)
                    .await
                    .map_err(|e| TransportError::Tls(format!("handshake failed: {}", e)))?;
                Ok(Box::new(stream))
            }
            TlsContext::Client(connector) => {
                let host = server_name
                    .ok_or_else(|| TransportError::Tls("client handshake needs a server name".into()))?;
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| TransportError::Tls(format!("invalid server name '{}': {}", host, e)))?;
                let stream = connector
                    .connect(name, io)
                    .await
                    .map_err(|e| TransportError::Tls(format!("handshake with {} failed: {}", host, e)))?;
                Ok(Box::new(stream))
            }
        }
    }
}

fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>, TransportError> {
    if names.is_empty() {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    }
    names
        .iter()
        .map(|name| match name.as_str() {
            "TLSv1.2" => Ok(&rustls::version::TLS12),
            "TLSv1.3" => Ok(&rustls::version::TLS13),
            other => Err(TransportError::Tls(format!("unsupported protocol '{}'", other))),
        })
        .collect()
}

fn crypto_provider(ciphers: &[String]) -> Result<Arc<CryptoProvider>, TransportError> {
    let mut provider = aws_lc_rs::default_provider();
    if !ciphers.is_empty() {
        provider
            .cipher_suites
            .retain(|suite| ciphers.iter().any(|c| *c == format!("{:?}", suite.suite())));
        if provider.cipher_suites.is_empty() {
            return Err(TransportError::Tls(format!(
                "none of the configured ciphers are supported: {}",
                ciphers.join(", ")
            )));
        }
    }
    Ok(Arc::new(provider))
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::Tls(format!("cannot read {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("invalid certificate in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| TransportError::Tls(format!("invalid private key in {}: {}", path.display(), e)))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

/// Load a rustls server configuration from PEM files.
pub fn load_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>, TransportError> {
    let certs = load_certs(Path::new(&config.cert_path))?;
    let key = load_key(Path::new(&config.key_path))?;
    let versions = protocol_versions(&config.protocols)?;

    let mut server = ServerConfig::builder_with_provider(crypto_provider(&config.ciphers)?)
        .with_protocol_versions(&versions)
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    server.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(server))
}

/// Load a rustls client configuration.
pub fn load_client_config(config: &ClientTlsConfig) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    match &config.trust_store_path {
        Some(path) => {
            for cert in load_certs(Path::new(path))? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("invalid trust anchor: {}", e)))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                tracing::warn!(error = %err, "Certificate load error");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            tracing::debug!(added, ignored, "Loaded platform trust store");
        }
    }

    let versions = protocol_versions(&config.protocols)?;
    let client = ClientConfig::builder_with_provider(crypto_provider(&config.ciphers)?)
        .with_protocol_versions(&versions)
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(client))
}
