//! Shared fixtures: stub TLS backends and in-process broker peers

#![allow(dead_code)]

use bored_crypto::{
    seal_envelope, AgentIdentity, Direction, HpkeHeaderCodec, RecordOpener, RecordSealer,
    StreamKeyMaterial,
};
use bored_transport::{ensure_crypto_provider, Multiplexer, MuxStream, Role};
use bored_tunnel::{
    BackendConfig, BackendDialer, BackendVerification, PipelineContext, SecureStreamPipeline,
};
use bytes::BytesMut;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::WebSocketStream;

/// A TLS server that echoes every connection back and records what it saw
pub struct EchoBackend {
    pub port: u16,
    pub ca_pem: String,
    pub connections: Arc<AtomicUsize>,
    /// Connections that completed an abbreviated handshake
    pub resumed: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl EchoBackend {
    /// Backend with a self-signed certificate for `names`
    pub async fn start(names: &[&str]) -> Self {
        Self::start_with(names, false).await
    }

    /// Backend that forgets every session, so no ticket it issued is accepted
    pub async fn start_forgetful(names: &[&str]) -> Self {
        Self::start_with(names, true).await
    }

    async fn start_with(names: &[&str], forget_sessions: bool) -> Self {
        ensure_crypto_provider();

        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names).unwrap();
        let cert_der: CertificateDer<'static> = certified.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let server_config = move || {
            Arc::new(
                rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(vec![cert_der.clone()], key_der.clone_key())
                    .unwrap(),
            )
        };
        let shared = tokio_rustls::TlsAcceptor::from(server_config());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let resumed = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let connections_clone = connections.clone();
        let resumed_clone = resumed.clone();
        let received_clone = received.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = if forget_sessions {
                    tokio_rustls::TlsAcceptor::from(server_config())
                } else {
                    shared.clone()
                };
                let connections = connections_clone.clone();
                let resumed = resumed_clone.clone();
                let received = received_clone.clone();

                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(socket).await else {
                        return;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    if tls.get_ref().1.handshake_kind() == Some(rustls::HandshakeKind::Resumed) {
                        resumed.fetch_add(1, Ordering::SeqCst);
                    }

                    let mut seen = Vec::new();
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match tls.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if tls.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                                let _ = tls.flush().await;
                            }
                        }
                    }
                    received.lock().unwrap().push(seen);
                    let _ = tls.shutdown().await;
                });
            }
        });

        Self {
            port,
            ca_pem: certified.cert.pem(),
            connections,
            resumed,
            received,
        }
    }

    /// Write the certificate to a file usable as a CA bundle
    pub fn write_ca(&self, dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, &self.ca_pem).unwrap();
        path
    }

    pub fn backend_config(
        &self,
        verification: BackendVerification,
        ca: Option<PathBuf>,
    ) -> BackendConfig {
        BackendConfig {
            host: "localhost".to_string(),
            port: self.port,
            ca_cert_path: ca,
            verification,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Agent and broker multiplexers joined by an in-memory pipe
pub async fn mux_pair() -> (Multiplexer, Multiplexer) {
    let (a, b) = tokio::io::duplex(1024 * 1024);
    let agent_ws = WebSocketStream::from_raw_socket(a, WsRole::Client, None).await;
    let broker_ws = WebSocketStream::from_raw_socket(b, WsRole::Server, None).await;
    (
        Multiplexer::new(agent_ws, Role::Server),
        Multiplexer::new(broker_ws, Role::Client),
    )
}

/// Pipeline context without impersonation
pub fn pipeline_context(identity: Arc<AgentIdentity>, dialer: Arc<BackendDialer>) -> Arc<PipelineContext> {
    Arc::new(PipelineContext {
        identity,
        header_codec: Arc::new(HpkeHeaderCodec),
        backend: dialer,
        impersonation: None,
    })
}

/// Serve every stream the agent multiplexer accepts
pub fn serve_agent(agent: Multiplexer, ctx: Arc<PipelineContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(stream) = agent.accept_stream().await {
            let pipeline = SecureStreamPipeline::new(ctx.clone(), stream.stream_id());
            tokio::spawn(async move {
                let _ = pipeline.run(stream).await;
            });
        }
    })
}

/// Broker side of one logical stream
pub struct BrokerStream {
    pub stream: MuxStream,
    sealer: RecordSealer,
    opener: RecordOpener,
    pending: BytesMut,
}

impl BrokerStream {
    /// Open a stream and send its handshake envelope
    pub async fn open(broker: &Multiplexer, agent_public_key: &[u8]) -> Self {
        let material = StreamKeyMaterial::generate();
        let mut stream = broker.open_stream().unwrap();
        stream
            .send(&seal_envelope(agent_public_key, &material).unwrap())
            .await
            .unwrap();

        Self {
            stream,
            sealer: RecordSealer::new(&material, Direction::Inbound).unwrap(),
            opener: RecordOpener::new(&material, Direction::Outbound).unwrap(),
            pending: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, plaintext: &[u8]) {
        let sealed = self.sealer.seal(plaintext).unwrap();
        self.stream.send(&sealed).await.unwrap();
    }

    pub async fn finish(&mut self) {
        self.stream.finish().await.unwrap();
    }

    /// Read and decrypt until the agent finishes the stream
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, bored_transport::TransportError> {
        let mut out = Vec::new();
        loop {
            while let Some(plaintext) = self.opener.open_next(&mut self.pending).unwrap() {
                out.extend_from_slice(&plaintext);
            }
            match self.stream.recv().await? {
                Some(data) => self.pending.extend_from_slice(&data),
                None => return Ok(out),
            }
        }
    }
}

/// A loopback broker that accepts agent connections and counts them
pub struct StubBroker {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    pub public_keys: Arc<Mutex<Vec<String>>>,
    pub sessions: tokio::sync::mpsc::UnboundedReceiver<Multiplexer>,
}

impl StubBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let public_keys = Arc::new(Mutex::new(Vec::new()));
        let (session_tx, sessions) = tokio::sync::mpsc::unbounded_channel();

        let connections_clone = connections.clone();
        let keys_clone = public_keys.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                connections_clone.fetch_add(1, Ordering::SeqCst);

                let keys = keys_clone.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    if let Some(key) = req
                        .headers()
                        .get(bored_proto::PUBLIC_KEY_HEADER)
                        .and_then(|v| v.to_str().ok())
                    {
                        keys.lock().unwrap().push(key.to_string());
                    }
                    Ok(resp)
                };

                if let Ok(ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await {
                    let _ = session_tx.send(Multiplexer::new(ws, Role::Client));
                }
            }
        });

        Self {
            url: format!("http://{}", addr),
            connections,
            public_keys,
            sessions,
        }
    }

    pub async fn next_session(&mut self) -> Multiplexer {
        tokio::time::timeout(Duration::from_secs(5), self.sessions.recv())
            .await
            .expect("agent did not connect")
            .expect("broker stopped")
    }
}
