//! TLS connections to the protected backend

use bored_transport::ensure_crypto_provider;
use rustls::pki_types::{CertificateDer, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, BackendVerification};
use crate::{ClientError, PipelineError, SessionTicketCache};

pub type BackendStream = TlsStream<TcpStream>;

/// Opens one TLS connection to the backend per stream
///
/// The rustls configuration, and with it the session cache, is built once
/// and shared by every dial.
pub struct BackendDialer {
    connector: tokio_rustls::TlsConnector,
    server_name: ServerName<'static>,
    host: String,
    port: u16,
    dial_timeout: Duration,
    verification: BackendVerification,
    session_cache: Arc<SessionTicketCache>,
}

impl std::fmt::Debug for BackendDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDialer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("verification", &self.verification)
            .finish()
    }
}

impl BackendDialer {
    pub fn new(config: &BackendConfig) -> Result<Self, ClientError> {
        ensure_crypto_provider();

        let ca_path = config.ca_cert_path.as_deref();
        let verification = resolve_verification(config.verification, ca_path)?;

        let session_cache = Arc::new(SessionTicketCache::new());

        let mut client_crypto = match verification {
            BackendVerification::Strict => {
                let path = ca_path.ok_or_else(|| {
                    ClientError::Config("strict backend verification needs a CA bundle".into())
                })?;

                let mut roots = rustls::RootCertStore::empty();
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(|e| {
                        ClientError::Config(format!("Invalid root cert in {}: {}", path.display(), e))
                    })?;
                }
                info!(
                    "Backend certificates verified against {} ({} roots)",
                    path.display(),
                    roots.len()
                );

                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            _ => {
                warn!(
                    "Backend certificate verification is DISABLED: connections to {}:{} are open to interception",
                    config.host, config.port
                );
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(SkipVerification::new())
                    .with_no_client_auth()
            }
        };

        client_crypto.resumption = rustls::client::Resumption::store(session_cache.clone());

        let server_name = ServerName::try_from(config.host.clone()).map_err(|e| {
            ClientError::Config(format!("Invalid backend host '{}': {}", config.host, e))
        })?;

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_crypto)),
            server_name,
            host: config.host.clone(),
            port: config.port,
            dial_timeout: config.dial_timeout,
            verification,
            session_cache,
        })
    }

    /// Resolved verification mode, never `Auto`
    pub fn verification(&self) -> BackendVerification {
        self.verification
    }

    pub fn session_cache(&self) -> &Arc<SessionTicketCache> {
        &self.session_cache
    }

    /// Connect and complete the TLS handshake, bounded by the dial timeout
    pub async fn dial(&self) -> Result<BackendStream, PipelineError> {
        tokio::time::timeout(self.dial_timeout, self.dial_inner())
            .await
            .map_err(|_| PipelineError::BackendTimeout(self.dial_timeout))?
    }

    async fn dial_inner(&self) -> Result<BackendStream, PipelineError> {
        let tcp_stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                PipelineError::BackendDial(format!("{}:{}: {}", self.host, self.port, e))
            })?;
        tcp_stream.set_nodelay(true)?;

        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), tcp_stream)
            .await
            .map_err(|e| PipelineError::BackendTls(e.to_string()))?;

        debug!("Connected to backend {}:{}", self.host, self.port);
        Ok(tls_stream)
    }
}

fn resolve_verification(
    requested: BackendVerification,
    ca_path: Option<&Path>,
) -> Result<BackendVerification, ClientError> {
    let ca_present = ca_path.map(Path::exists).unwrap_or(false);

    match requested {
        BackendVerification::Auto if ca_present => Ok(BackendVerification::Strict),
        BackendVerification::Auto => Ok(BackendVerification::Disabled),
        BackendVerification::Strict if !ca_present => Err(ClientError::Config(format!(
            "strict backend verification requested but CA bundle {} is missing",
            ca_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<none>".to_string())
        ))),
        other => Ok(other),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::Config(format!("Failed to open CA bundle: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Config(format!("Failed to parse CA bundle: {}", e)))?;

    if certs.is_empty() {
        return Err(ClientError::Config(format!(
            "CA bundle {} contains no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(verification: BackendVerification, ca: Option<PathBuf>) -> BackendConfig {
        BackendConfig {
            host: "localhost".to_string(),
            port: 6443,
            ca_cert_path: ca,
            verification,
            dial_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_auto_without_bundle_is_disabled() {
        let dialer = BackendDialer::new(&config(
            BackendVerification::Auto,
            Some(PathBuf::from("/nonexistent/ca.crt")),
        ))
        .unwrap();
        assert_eq!(dialer.verification(), BackendVerification::Disabled);
    }

    #[test]
    fn test_auto_with_bundle_is_strict() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, cert.cert.pem()).unwrap();

        let dialer = BackendDialer::new(&config(BackendVerification::Auto, Some(ca_path))).unwrap();
        assert_eq!(dialer.verification(), BackendVerification::Strict);
    }

    #[test]
    fn test_strict_without_bundle_fails() {
        let result = BackendDialer::new(&config(BackendVerification::Strict, None));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_empty_bundle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, "").unwrap();

        let result = BackendDialer::new(&config(BackendVerification::Strict, Some(ca_path)));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_dial_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut backend = config(BackendVerification::Disabled, None);
        backend.host = "127.0.0.1".to_string();
        backend.port = port;

        let dialer = BackendDialer::new(&backend).unwrap();
        assert!(matches!(
            dialer.dial().await,
            Err(PipelineError::BackendDial(_))
        ));
    }
}
