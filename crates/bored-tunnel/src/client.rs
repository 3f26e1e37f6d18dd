//! Tunnel Client: broker connectivity and session lifecycle

use bored_crypto::{AgentIdentity, HeaderCodec, HpkeHeaderCodec};
use bored_impersonation::ImpersonationFilter;
use bored_transport::{BrokerConnector, BrokerCredentials, Multiplexer, MuxStream};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    AgentConfig, BackendDialer, Backoff, ClientError, PipelineContext, SecureStreamPipeline,
};

/// Lifecycle of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// The single pending reconnect timer and the backoff driving it
struct RetryState {
    backoff: Backoff,
    pending: Option<JoinHandle<()>>,
    /// Identifies the most recently armed timer
    ticket: u64,
}

/// The live broker connection and the task accepting its streams
struct Session {
    generation: u64,
    mux: Arc<Multiplexer>,
    stop: CancellationToken,
    accept_task: JoinHandle<()>,
}

struct ClientInner {
    credentials: BrokerCredentials,
    connector: BrokerConnector,
    header_codec: Arc<dyn HeaderCodec>,
    backend: Arc<BackendDialer>,
    impersonation: Option<Arc<dyn ImpersonationFilter>>,
    shutdown_grace: Duration,

    identity: OnceLock<Arc<AgentIdentity>>,
    state: watch::Sender<ClientState>,
    shutting_down: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    retry: Mutex<RetryState>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,

    pipelines: TaskTracker,
    abort_pipelines: CancellationToken,
}

/// Keeps the agent connected to the broker and serves its streams
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl TunnelClient {
    /// Client with the default HPKE header codec
    pub fn new(config: AgentConfig) -> Result<Self, ClientError> {
        Self::with_header_codec(config, Arc::new(HpkeHeaderCodec))
    }

    pub fn with_header_codec(
        config: AgentConfig,
        header_codec: Arc<dyn HeaderCodec>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let backend = Arc::new(BackendDialer::new(&config.backend)?);
        let impersonation = config.impersonation.build_filter()?;
        let (state, _) = watch::channel(ClientState::Disconnected);

        Ok(Self {
            inner: Arc::new(ClientInner {
                credentials: config.credentials,
                connector: BrokerConnector::new().with_connect_timeout(config.connect_timeout),
                header_codec,
                backend,
                impersonation,
                shutdown_grace: config.shutdown_grace,
                identity: OnceLock::new(),
                state,
                shutting_down: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
                retry: Mutex::new(RetryState {
                    backoff: Backoff::new(config.reconnect),
                    pending: None,
                    ticket: 0,
                }),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                pipelines: TaskTracker::new(),
                abort_pipelines: CancellationToken::new(),
            }),
        })
    }

    /// Install the agent identity; must happen once, before `connect`
    pub fn initialize(&self, identity: AgentIdentity) -> Result<(), ClientError> {
        let public_key = identity.public_key_b64();
        self.inner
            .identity
            .set(Arc::new(identity))
            .map_err(|_| ClientError::AlreadyInitialized)?;

        info!(public_key = %public_key, "Agent identity initialized");
        Ok(())
    }

    /// Dial the broker and start serving streams
    ///
    /// A failed attempt schedules a reconnect before returning the error.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.connect().await
    }

    /// Arm the reconnect timer, superseding any pending one
    pub fn schedule_reconnect(&self) {
        self.inner.schedule_reconnect();
    }

    /// Stop the session without reconnecting
    ///
    /// Live streams get the configured grace period to finish before they
    /// are aborted.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Connect, wait for `shutdown`, then disconnect
    pub async fn run_until_shutdown<F>(&self, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        match self.connect().await {
            Ok(()) | Err(ClientError::Transport(_)) => {}
            Err(e) => {
                error!(error = %e, "Cannot start tunnel client");
                return Err(e);
            }
        }

        shutdown.await;
        info!("Shutdown requested");
        self.disconnect().await;
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        lock(&self.inner.retry)
            .pending
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Pipelines still running
    pub fn active_streams(&self) -> usize {
        self.inner.pipelines.len()
    }

    pub fn backend(&self) -> &Arc<BackendDialer> {
        &self.inner.backend
    }

    pub fn impersonation_enabled(&self) -> bool {
        self.inner.impersonation.is_some()
    }
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("credentials", &self.inner.credentials)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let identity = self
            .identity
            .get()
            .cloned()
            .ok_or(ClientError::NotInitialized)?;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ClientError::ShuttingDown);
        }

        let _guard = self.connect_lock.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ClientError::ShuttingDown);
        }

        // The previous multiplexer must deliver no more streams
        self.detach_session("reconnecting").await;

        self.state.send_if_modified(|state| {
            let closing = *state == ClientState::Closing;
            if !closing {
                *state = ClientState::Connecting;
            }
            !closing
        });
        info!(server = %self.credentials.server_url, "Connecting to broker");

        let mux = match self
            .connector
            .connect(&self.credentials, &identity.public_key_b64())
            .await
        {
            Ok(mux) => mux,
            Err(e) => {
                warn!(error = %e, "Failed to connect to broker");
                self.transition(ClientState::Connecting, ClientState::Disconnected);
                self.schedule_reconnect();
                return Err(e.into());
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mux = Arc::new(mux);
        let stop = CancellationToken::new();
        let ctx = Arc::new(PipelineContext {
            identity,
            header_codec: self.header_codec.clone(),
            backend: self.backend.clone(),
            impersonation: self.impersonation.clone(),
        });

        // `disconnect` raises the flag before taking the session lock, so
        // either it finds the new session or the flag is seen here
        let refused = {
            let mut session = lock(&self.session);
            if self.shutting_down.load(Ordering::SeqCst) {
                Some(mux)
            } else {
                let accept_task = tokio::spawn(Arc::clone(self).serve(
                    mux.clone(),
                    ctx,
                    stop.clone(),
                    generation,
                ));

                info!(connection_id = %mux.connection_id(), "Tunnel connected");
                *session = Some(Session {
                    generation,
                    mux,
                    stop,
                    accept_task,
                });
                self.transition(ClientState::Connecting, ClientState::Connected);
                None
            }
        };

        if let Some(mux) = refused {
            debug!(connection_id = %mux.connection_id(), "Shutdown began during dial");
            mux.close("agent shutting down").await;
            self.transition(ClientState::Connecting, ClientState::Disconnected);
            return Err(ClientError::ShuttingDown);
        }

        lock(&self.retry).backoff.reset();
        Ok(())
    }

    /// Move `from` to `to`; a concurrent `Closing` wins
    fn transition(&self, from: ClientState, to: ClientState) {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    /// Accept streams until the transport ends or the session is detached
    async fn serve(
        self: Arc<Self>,
        mux: Arc<Multiplexer>,
        ctx: Arc<PipelineContext>,
        stop: CancellationToken,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                accepted = mux.accept_stream() => match accepted {
                    Some(stream) => self.spawn_pipeline(ctx.clone(), stream),
                    None => break,
                },
            }
        }

        let reason = mux
            .close_reason()
            .unwrap_or_else(|| "transport closed".to_string());
        warn!(
            connection_id = %mux.connection_id(),
            reason = %reason,
            "Broker connection lost"
        );
        self.on_transport_lost(generation);
    }

    fn spawn_pipeline(&self, ctx: Arc<PipelineContext>, stream: MuxStream) {
        let stream_id = stream.stream_id();
        let abort = self.abort_pipelines.clone();

        self.pipelines.spawn(async move {
            let pipeline = SecureStreamPipeline::new(ctx, stream_id);
            tokio::select! {
                // Outcome is logged by the pipeline
                _ = pipeline.run(stream) => {}
                _ = abort.cancelled() => {
                    warn!(stream_id, "Stream aborted at shutdown");
                }
            }
        });
    }

    fn on_transport_lost(self: &Arc<Self>, generation: u64) {
        let lost = {
            let mut session = lock(&self.session);
            match session.as_ref() {
                Some(current) if current.generation == generation => session.take(),
                _ => None,
            }
        };
        // Superseded or intentionally detached
        if lost.is_none() {
            return;
        }

        self.state.send_replace(ClientState::Disconnected);
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Shutting down, not scheduling reconnect");
            return;
        }

        let mut retry = lock(&self.retry);
        if let Some(previous) = retry.pending.take() {
            previous.abort();
        }

        retry.ticket += 1;
        let ticket = retry.ticket;
        let delay = retry.backoff.next_delay();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = retry.backoff.attempt(),
            "Reconnect scheduled"
        );

        let inner = Arc::clone(self);
        retry.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if inner.shutting_down.load(Ordering::SeqCst) {
                debug!("Shutting down, reconnect skipped");
                return;
            }
            {
                let mut retry = lock(&inner.retry);
                if retry.ticket != ticket {
                    return;
                }
                retry.pending = None;
            }

            // Failure schedules the next attempt
            let _ = inner.connect().await;
        }));
    }

    /// Stop accepting on the current session and close its transport
    async fn detach_session(&self, reason: &str) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            debug!(connection_id = %session.mux.connection_id(), "Detaching session");
            session.stop.cancel();
            session.mux.stop_accepting().await;
            session.mux.close(reason).await;
            let _ = session.accept_task.await;
        }
    }

    async fn disconnect(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ClientState::Closing);
        info!("Disconnecting from broker");

        if let Some(timer) = lock(&self.retry).pending.take() {
            timer.abort();
        }

        let session = lock(&self.session).take();
        if let Some(session) = &session {
            session.stop.cancel();
            // Draining streams keep their windows; new ones are refused
            session.mux.stop_accepting().await;
        }

        self.pipelines.close();
        if !self.pipelines.is_empty() {
            info!(
                streams = self.pipelines.len(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Waiting for live streams to finish"
            );
        }
        if tokio::time::timeout(self.shutdown_grace, self.pipelines.wait())
            .await
            .is_err()
        {
            warn!(
                streams = self.pipelines.len(),
                "Grace period elapsed, aborting remaining streams"
            );
            self.abort_pipelines.cancel();
            self.pipelines.wait().await;
        }

        if let Some(session) = session {
            session.mux.close("agent shutdown").await;
            let _ = session.accept_task.await;
        }

        self.state.send_replace(ClientState::Disconnected);
        info!("Tunnel client stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
