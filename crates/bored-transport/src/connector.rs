//! Dialing the broker

use bored_proto::{CONNECT_PATH, PUBLIC_KEY_HEADER};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderName, HeaderValue};
use tracing::{debug, info};
use url::Url;

use crate::{Multiplexer, Role, TransportError, TransportResult};

/// Broker address and bearer credentials
#[derive(Clone)]
pub struct BrokerCredentials {
    /// Broker base URL (`http(s)://` or `ws(s)://`)
    pub server_url: String,
    /// Bearer token presented on connect
    pub bearer_token: String,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("server_url", &self.server_url)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

impl BrokerCredentials {
    /// WebSocket URL of the connect endpoint
    pub fn connect_url(&self) -> TransportResult<Url> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.server_url, e)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(self.server_url.clone()))?;

        let path = format!("{}{}", url.path().trim_end_matches('/'), CONNECT_PATH);
        url.set_path(&path);
        Ok(url)
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Default bound on TCP connect, TLS handshake and WebSocket upgrade together
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Establishes the agent's WebSocket connection to the broker
#[derive(Clone)]
pub struct BrokerConnector {
    tls_connector: tokio_rustls::TlsConnector,
    connect_timeout: Duration,
}

impl std::fmt::Debug for BrokerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl BrokerConnector {
    /// Connector trusting the webpki root set for `wss://` brokers
    pub fn new() -> Self {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let client_crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self::with_tls_config(Arc::new(client_crypto))
    }

    /// Connector with a caller-provided TLS configuration
    pub fn with_tls_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls_connector: tokio_rustls::TlsConnector::from(config),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Dial the broker, authenticate, and bind a server-role multiplexer
    ///
    /// The whole dial is bounded by the connect timeout; a broker that
    /// accepts the connection but never answers yields `ConnectTimeout`.
    pub async fn connect(
        &self,
        credentials: &BrokerCredentials,
        public_key_b64: &str,
    ) -> TransportResult<Multiplexer> {
        let url = credentials.connect_url()?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no host", url)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no port", url)))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", credentials.bearer_token))
                .map_err(|_| TransportError::ConnectionError("invalid bearer token".into()))?,
        );
        headers.insert(
            HeaderName::from_static(PUBLIC_KEY_HEADER),
            HeaderValue::from_str(public_key_b64).map_err(|_| {
                TransportError::ConnectionError(format!("invalid {} value", PUBLIC_KEY_HEADER))
            })?,
        );

        debug!("Connecting to broker: {}", url);

        let mux = tokio::time::timeout(self.connect_timeout, self.dial(&url, &host, port, request))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        info!(
            connection_id = %mux.connection_id(),
            "Connected to broker at {}",
            url
        );

        Ok(mux)
    }

    async fn dial(
        &self,
        url: &Url,
        host: &str,
        port: u16,
        request: Request,
    ) -> TransportResult<Multiplexer> {
        let tcp_stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        tcp_stream.set_nodelay(true)?;

        let mux = if url.scheme() == "wss" {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;
            let tls_stream = self
                .tls_connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

            let (ws_stream, _response) =
                tokio_tungstenite::client_async(request, tls_stream).await?;
            Multiplexer::new(ws_stream, Role::Server)
        } else {
            let (ws_stream, _response) =
                tokio_tungstenite::client_async(request, tcp_stream).await?;
            Multiplexer::new(ws_stream, Role::Server)
        };

        Ok(mux)
    }
}

impl Default for BrokerConnector {
    fn default() -> Self {
        Self::new()
    }
}
