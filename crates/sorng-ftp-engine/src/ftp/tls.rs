//! TLS activation for Explicit and Implicit FTPS (RFC 4217).
//!
//! The engine never speaks TLS itself: a [`TlsProvider`] wraps an already
//! connected socket. The default provider is rustls with the platform
//! root store; one `ClientConfig` is shared by the control connection and
//! every data connection so data channels can resume the control session.

use crate::ftp::error::{FtpError, FtpResult};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Wraps a connected socket in TLS.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    async fn activate(&self, tcp: TcpStream, host: &str) -> FtpResult<TlsStream<TcpStream>>;
}

/// rustls-backed provider.
pub struct RustlsProvider {
    config: Arc<rustls::ClientConfig>,
}

impl RustlsProvider {
    /// Platform roots; `accept_invalid_certs` disables verification.
    pub fn new(accept_invalid_certs: bool) -> FtpResult<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::warn!("Skipping unreadable native certificate: {}", err);
        }
        let (added, ignored) = root_store.add_parsable_certificates(native.certs);
        log::debug!("Loaded {} native root certificates ({} ignored)", added, ignored);

        let mut tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if accept_invalid_certs {
            log::warn!("FTPS certificate verification disabled – insecure!");
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertVerifier));
        }

        Ok(Self {
            config: Arc::new(tls_config),
        })
    }

    /// Use a caller-built config (client certificates, pinned roots, …).
    pub fn from_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TlsProvider for RustlsProvider {
    async fn activate(&self, tcp: TcpStream, host: &str) -> FtpResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| FtpError::tls_failed(format!("Invalid server name '{}': {}", host, e)))?;
        TlsConnector::from(self.config.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|e| FtpError::tls_failed(format!("TLS handshake with {}: {}", host, e)))
    }
}

// ─── NoCertVerifier (for self-signed certs) ─────────────────────────

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_server_name() {
        let provider = RustlsProvider::new(true).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let err = provider.activate(tcp, "bad host name!").await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::TlsFailed);
    }
}
