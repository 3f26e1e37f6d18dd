//! Multiplexed WebSocket connection

use bored_proto::Frame;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::stream::{lock_registry, MuxStream, StreamEvent, StreamRegistry};
use crate::{TransportError, TransportResult};

/// Interval between keep-alive pings
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How long `close()` waits for the close frame to be written
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Inbound streams waiting for `accept_stream`; beyond this new streams are refused
const ACCEPT_BACKLOG: usize = 64;

/// Which side of the stream-opening relationship this end plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts streams opened by the peer (the agent)
    Server,
    /// Opens streams (the broker side)
    Client,
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_streams: usize,
    pub uptime_secs: u64,
}

/// Counters shared between the connection handle and its I/O tasks
#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Many logical streams over one WebSocket connection
pub struct Multiplexer {
    connection_id: String,
    role: Role,
    frame_tx: mpsc::Sender<Message>,
    streams: StreamRegistry,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    /// Cleared by `stop_accepting`; the reader then refuses new streams
    accepting: Arc<AtomicBool>,
    next_stream_id: AtomicU32,
    counters: Arc<Counters>,
    created_at: Instant,
    /// Cancelled once the transport is gone, for whatever reason
    closed: CancellationToken,
    /// Cancelled by a local `close()` to stop the reader
    shutdown: CancellationToken,
    close_reason: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .finish()
    }
}

impl Multiplexer {
    /// Bind a multiplexer to an established WebSocket
    pub fn new<S>(ws_stream: WebSocketStream<S>, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
        let (ws_sink, ws_source) = ws_stream.split();

        let (frame_tx, frame_rx) = mpsc::channel::<Message>(256);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let accepting = Arc::new(AtomicBool::new(true));
        let streams: StreamRegistry = Arc::default();
        let counters = Arc::new(Counters::default());
        let closed = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let close_reason = Arc::new(Mutex::new(None));

        // Client-opened streams use odd ids, server-opened even
        let next_stream_id = match role {
            Role::Client => 1,
            Role::Server => 2,
        };

        tokio::spawn(Self::writer_task(
            ws_sink,
            frame_rx,
            counters.clone(),
            closed.clone(),
            connection_id.clone(),
        ));

        tokio::spawn(
            ReaderTask {
                role,
                streams: streams.clone(),
                accept_tx,
                accepting: accepting.clone(),
                frame_tx: frame_tx.clone(),
                counters: counters.clone(),
                closed: closed.clone(),
                shutdown: shutdown.clone(),
                close_reason: close_reason.clone(),
                conn_id: connection_id.clone(),
                last_accepted: 0,
            }
            .run(ws_source),
        );

        Self {
            connection_id,
            role,
            frame_tx,
            streams,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            accepting,
            next_stream_id: AtomicU32::new(next_stream_id),
            counters,
            created_at: Instant::now(),
            closed,
            shutdown,
            close_reason,
        }
    }

    /// Writer task - sends frames to the WebSocket and keeps the connection alive
    async fn writer_task<W>(
        mut sink: W,
        mut rx: mpsc::Receiver<Message>,
        counters: Arc<Counters>,
        closed: CancellationToken,
        conn_id: String,
    ) where
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.tick().await; // First tick completes immediately

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let is_close = matches!(msg, Message::Close(_));
                    counters.bytes_sent.fetch_add(msg.len() as u64, Ordering::Relaxed);

                    if let Err(e) = sink.send(msg).await {
                        error!("[{}] WebSocket send error: {}", conn_id, e);
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                _ = keep_alive.tick() => {
                    trace!("[{}] Sending keep-alive ping", conn_id);
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        error!("[{}] WebSocket ping error: {}", conn_id, e);
                        break;
                    }
                }
                _ = closed.cancelled() => break,
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
        closed.cancel();
        let _ = sink.close().await;
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Open a new outbound stream
    pub fn open_stream(&self) -> TransportResult<MuxStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (stream, _) = MuxStream::register(stream_id, &self.streams, self.frame_tx.clone());

        debug!("[{}] Opened stream {}", self.connection_id, stream_id);
        Ok(stream)
    }

    /// Accept the next stream opened by the peer
    ///
    /// Returns `None` once the transport is closed and no more streams will arrive.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        let stream = accept_rx.recv().await?;
        debug!(
            "[{}] Accepted stream {}",
            self.connection_id,
            stream.stream_id()
        );
        Some(stream)
    }

    /// Refuse every stream the peer opens from now on
    ///
    /// Streams already accepted keep running. Streams still waiting in the
    /// accept backlog, and any opened later, are reset, and `accept_stream`
    /// returns `None`.
    pub async fn stop_accepting(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.close();
        let mut refused = 0;
        // Dropping an unaccepted stream resets it
        while let Ok(stream) = accept_rx.try_recv() {
            drop(stream);
            refused += 1;
        }
        debug!(
            "[{}] Stopped accepting streams ({} queued streams reset)",
            self.connection_id, refused
        );
    }

    /// Close the connection gracefully
    pub async fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!("[{}] Closing connection: {}", self.connection_id, reason);

        let frame = CloseFrame {
            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        let _ = self.frame_tx.send(Message::Close(Some(frame))).await;

        // The writer marks the connection closed once the close frame is out
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.closed.cancelled()).await;
        self.shutdown.cancel();
    }

    /// Resolves once the transport has ended
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Why the transport ended, if it has
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .ok()
            .and_then(|reason| reason.clone())
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            active_streams: lock_registry(&self.streams).len(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reader task - receives frames and dispatches them to streams
struct ReaderTask {
    role: Role,
    streams: StreamRegistry,
    accept_tx: mpsc::Sender<MuxStream>,
    accepting: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<Message>,
    counters: Arc<Counters>,
    closed: CancellationToken,
    shutdown: CancellationToken,
    close_reason: Arc<Mutex<Option<String>>>,
    conn_id: String,
    /// Highest stream id accepted from the peer; ids must increase
    last_accepted: u32,
}

impl ReaderTask {
    async fn run<R>(mut self, mut source: R)
    where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let reason = loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = self.shutdown.cancelled() => break "closed locally".to_string(),
            };

            match next {
                Some(Ok(Message::Binary(data))) => {
                    self.counters
                        .bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);

                    match Frame::decode(&data) {
                        Ok(frame) => self.dispatch(frame).await,
                        Err(e) => warn!("[{}] Dropping invalid frame: {}", self.conn_id, e),
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // Pong is automatically handled by tungstenite
                    trace!("[{}] Received ping", self.conn_id);
                }
                Some(Ok(Message::Pong(_))) => {
                    trace!("[{}] Received pong", self.conn_id);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] WebSocket close received: {:?}", self.conn_id, frame);
                    break match frame {
                        Some(frame) => format!("closed by broker: {}", frame.reason),
                        None => "closed by broker".to_string(),
                    };
                }
                Some(Ok(_)) => {
                    // Text frames are not part of the protocol
                }
                Some(Err(e)) => {
                    error!("[{}] WebSocket read error: {}", self.conn_id, e);
                    break TransportError::from(e).to_string();
                }
                None => break "transport ended".to_string(),
            }
        };

        debug!("[{}] WebSocket reader task ended: {}", self.conn_id, reason);
        if let Ok(mut slot) = self.close_reason.lock() {
            slot.get_or_insert(reason);
        }
        self.closed.cancel();

        // Dropping the registered senders ends every stream with a connection error
        let entries: Vec<_> = lock_registry(&self.streams).drain().collect();
        for (_, entry) in entries {
            entry.send_credit.close();
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        trace!(
            "[{}] Received frame: stream={}, type={:?}",
            self.conn_id,
            stream_id,
            frame.frame_type()
        );

        match frame {
            Frame::Data { payload, .. } => {
                let len = payload.len() as u32;
                let known = {
                    let streams = lock_registry(&self.streams);
                    streams.get(&stream_id).map(|entry| {
                        let within_window = entry
                            .recv_window
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                                w.checked_sub(len)
                            })
                            .is_ok();
                        if within_window {
                            let _ = entry.events.send(StreamEvent::Data(payload.clone()));
                        }
                        within_window
                    })
                };

                match known {
                    Some(true) => {}
                    Some(false) => {
                        warn!(
                            "[{}] Stream {} exceeded its receive window, resetting",
                            self.conn_id, stream_id
                        );
                        self.reset_stream(stream_id).await;
                    }
                    None => self.open_inbound(stream_id, payload).await,
                }
            }
            Frame::Fin { .. } => {
                if let Some(entry) = lock_registry(&self.streams).get(&stream_id) {
                    let _ = entry.events.send(StreamEvent::Fin);
                }
            }
            Frame::Rst { .. } => {
                if let Some(entry) = lock_registry(&self.streams).remove(&stream_id) {
                    entry.send_credit.close();
                    let _ = entry.events.send(StreamEvent::Reset);
                }
            }
            Frame::WindowUpdate { increment, .. } => {
                if let Some(entry) = lock_registry(&self.streams).get(&stream_id) {
                    entry.send_credit.add_permits(increment as usize);
                }
            }
        }
    }

    async fn open_inbound(&mut self, stream_id: u32, payload: bytes::Bytes) {
        if self.role == Role::Client || stream_id <= self.last_accepted {
            debug!(
                "[{}] Data for unknown stream {}, answering with RST",
                self.conn_id, stream_id
            );
            let frame = Frame::Rst { stream_id };
            let _ = self.frame_tx.send(Message::Binary(frame.encode())).await;
            return;
        }

        if !self.accepting.load(Ordering::SeqCst) {
            self.last_accepted = stream_id;
            debug!(
                "[{}] Not accepting streams, refusing stream {}",
                self.conn_id, stream_id
            );
            let frame = Frame::Rst { stream_id };
            let _ = self.frame_tx.send(Message::Binary(frame.encode())).await;
            return;
        }

        if payload.len() > bored_proto::INITIAL_WINDOW as usize {
            self.reset_stream(stream_id).await;
            return;
        }

        self.last_accepted = stream_id;
        let (stream, handle) = MuxStream::register(stream_id, &self.streams, self.frame_tx.clone());
        if let Some(entry) = lock_registry(&self.streams).get(&stream_id) {
            entry
                .recv_window
                .fetch_sub(payload.len() as u32, Ordering::SeqCst);
        }
        if !payload.is_empty() {
            handle.push(StreamEvent::Data(payload));
        }

        // Never wait on the acceptor: the reader also feeds every live stream.
        // A refused stream is reset when dropped.
        match self.accept_tx.try_send(stream) {
            Ok(()) => {}
            Err(TrySendError::Full(stream)) => {
                warn!(
                    "[{}] Accept backlog full, refusing stream {}",
                    self.conn_id, stream_id
                );
                drop(stream);
            }
            Err(TrySendError::Closed(stream)) => {
                debug!(
                    "[{}] Not accepting streams, refusing stream {}",
                    self.conn_id, stream_id
                );
                drop(stream);
            }
        }
    }

    async fn reset_stream(&mut self, stream_id: u32) {
        if let Some(entry) = lock_registry(&self.streams).remove(&stream_id) {
            entry.send_credit.close();
            let _ = entry.events.send(StreamEvent::Reset);
        }
        let frame = Frame::Rst { stream_id };
        let _ = self.frame_tx.send(Message::Binary(frame.encode())).await;
    }
}
