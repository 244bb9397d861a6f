//! Plain and TLS byte streams.
//!
//! The reactor only needs a connected stream it can split into a read half
//! and a write half; certificates and trust roots come from the caller via
//! [`TlsOptions`].

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub use tokio_rustls::rustls;
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

use crate::error::{ReactorError, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to secure a connection.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Use this rustls config as-is. Takes precedence over the flags below.
    pub client_config: Option<Arc<rustls::ClientConfig>>,
    /// Name to verify the certificate against. Defaults to the host part of
    /// the address.
    pub server_name: Option<String>,
    /// Skip certificate verification (self-signed test servers).
    pub insecure: bool,
    /// Trust the platform's root store instead of the bundled webpki roots.
    pub native_roots: bool,
}

impl TlsOptions {
    fn client_config(&self) -> Arc<rustls::ClientConfig> {
        if let Some(config) = &self.client_config {
            return Arc::clone(config);
        }
        let config = if self.insecure {
            tracing::debug!("TLS: insecure mode (skipping cert verification)");
            insecure_client_config()
        } else if self.native_roots {
            native_client_config()
        } else {
            default_client_config()
        };
        Arc::new(config)
    }
}

/// A connected stream that has not started IRC yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl EstablishedConnection {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Self::Plain(tcp) => {
                let (reader, writer) = tcp.into_split();
                (Box::new(reader), Box::new(writer))
            }
            Self::Tls(tls) => {
                let (reader, writer) = tokio::io::split(*tls);
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

/// Open a TCP connection to `addr` (`host:port`), then run the TLS handshake
/// if `tls` is set.
pub async fn establish(addr: &str, tls: Option<&TlsOptions>) -> Result<EstablishedConnection> {
    let mode = if tls.is_some() { "TLS" } else { "plain" };
    tracing::debug!(addr, mode, "connecting");
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|source| ReactorError::Connect {
            addr: addr.to_string(),
            source,
        })?;

    let Some(options) = tls else {
        return Ok(EstablishedConnection::Plain(tcp));
    };

    let host = options
        .server_name
        .clone()
        .unwrap_or_else(|| host_of(addr).to_string());
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| ReactorError::InvalidServerName(host))?;
    let connector = TlsConnector::from(options.client_config());
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|source| ReactorError::Tls {
            addr: addr.to_string(),
            source,
        })?;
    tracing::debug!(addr, "TLS handshake complete");
    Ok(EstablishedConnection::Tls(Box::new(stream)))
}

/// Host part of `host:port` or `[v6]:port`.
fn host_of(addr: &str) -> &str {
    if let Some(bracketed) = addr.strip_prefix('[') {
        return bracketed.split_once(']').map_or(bracketed, |(host, _)| host);
    }
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

pub fn install_crypto_provider() {
    // ring wins when both providers are compiled in.
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

/// Client config trusting the bundled webpki roots.
pub fn default_client_config() -> rustls::ClientConfig {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config_with_roots(roots)
}

/// Client config trusting the platform's certificate store.
pub fn native_client_config() -> rustls::ClientConfig {
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        tracing::warn!(%error, "failed to load a native root certificate");
    }
    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::debug!(added, ignored, "loaded native root certificates");
    client_config_with_roots(roots)
}

/// Client config trusting exactly `roots`.
pub fn client_config_with_roots(roots: rustls::RootCertStore) -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Client config that accepts any certificate chain. Handshake signatures
/// are still checked against the presented certificate.
pub fn insecure_client_config() -> rustls::ClientConfig {
    install_crypto_provider();
    let builder = rustls::ClientConfig::builder();
    let verifier = ChainlessVerifier {
        algorithms: builder.crypto_provider().signature_verification_algorithms,
    };
    builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

/// Skips chain and name validation only.
#[derive(Debug)]
struct ChainlessVerifier {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for ChainlessVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        tracing::debug!(server_name = ?server_name, "accepting unverified certificate");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
