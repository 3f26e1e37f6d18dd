//! Logical streams carried over a multiplexed WebSocket connection
//!
//! A [`MuxStream`] is split into a send half and a receive half so that both
//! directions can be driven concurrently. Sending consumes credit granted
//! by the peer; receiving returns credit once data has been handed to the
//! caller, which bounds how much of a stream can be buffered in memory.

use bored_proto::{Frame, INITIAL_WINDOW, MAX_FRAME_PAYLOAD};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::{TransportError, TransportResult};

/// Events delivered from the connection reader to a stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset,
}

/// Reader-side bookkeeping for one stream
#[derive(Debug)]
pub(crate) struct StreamEntry {
    pub(crate) events: mpsc::UnboundedSender<StreamEvent>,
    pub(crate) send_credit: Arc<Semaphore>,
    pub(crate) recv_window: Arc<AtomicU32>,
}

pub(crate) type StreamRegistry = Arc<Mutex<HashMap<u32, StreamEntry>>>;

pub(crate) fn lock_registry(
    registry: &Mutex<HashMap<u32, StreamEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<u32, StreamEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by both halves of a stream
///
/// Dropping the last half unregisters the stream. A stream that was not
/// closed cleanly in both directions is reset so the peer can release it.
#[derive(Debug)]
struct StreamShared {
    stream_id: u32,
    registry: Weak<Mutex<HashMap<u32, StreamEntry>>>,
    frame_tx: mpsc::Sender<Message>,
    send_credit: Arc<Semaphore>,
    recv_window: Arc<AtomicU32>,
    fin_sent: AtomicBool,
    fin_received: AtomicBool,
    reset: AtomicBool,
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock_registry(&registry).remove(&self.stream_id);
        }

        let clean = self.fin_sent.load(Ordering::SeqCst) && self.fin_received.load(Ordering::SeqCst);
        if !clean && !self.reset.load(Ordering::SeqCst) {
            let frame = Frame::Rst {
                stream_id: self.stream_id,
            };
            // Best effort: the connection may already be gone
            let _ = self.frame_tx.try_send(Message::Binary(frame.encode()));
            trace!("Stream {} dropped before clean close, sent RST", self.stream_id);
        }
    }
}

/// A logical duplex stream over the multiplexed connection
#[derive(Debug)]
pub struct MuxStream {
    send: MuxSendHalf,
    recv: MuxRecvHalf,
}

impl MuxStream {
    /// Register a new stream and build both halves
    pub(crate) fn register(
        stream_id: u32,
        registry: &StreamRegistry,
        frame_tx: mpsc::Sender<Message>,
    ) -> (Self, StreamEntryHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let send_credit = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));
        let recv_window = Arc::new(AtomicU32::new(INITIAL_WINDOW));

        lock_registry(registry).insert(
            stream_id,
            StreamEntry {
                events: events_tx.clone(),
                send_credit: send_credit.clone(),
                recv_window: recv_window.clone(),
            },
        );

        let shared = Arc::new(StreamShared {
            stream_id,
            registry: Arc::downgrade(registry),
            frame_tx,
            send_credit,
            recv_window,
            fin_sent: AtomicBool::new(false),
            fin_received: AtomicBool::new(false),
            reset: AtomicBool::new(false),
        });

        let stream = Self {
            send: MuxSendHalf {
                shared: shared.clone(),
            },
            recv: MuxRecvHalf {
                shared,
                events: events_rx,
                unacked: 0,
                done: false,
            },
        };

        (stream, StreamEntryHandle { events: events_tx })
    }

    pub fn stream_id(&self) -> u32 {
        self.send.shared.stream_id
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (MuxSendHalf, MuxRecvHalf) {
        (self.send, self.recv)
    }

    pub async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        self.send.send(data).await
    }

    pub async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        self.recv.recv().await
    }

    pub async fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().await
    }
}

/// Used by the reader to seed a freshly opened inbound stream
pub(crate) struct StreamEntryHandle {
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEntryHandle {
    pub(crate) fn push(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

/// Sending half of a [`MuxStream`]
#[derive(Debug)]
pub struct MuxSendHalf {
    shared: Arc<StreamShared>,
}

impl MuxSendHalf {
    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id
    }

    /// Send bytes, waiting for peer credit when the window is exhausted
    pub async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.shared.fin_sent.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }

        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let permits = self
                .shared
                .send_credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| TransportError::StreamReset)?;
            permits.forget();

            let frame = Frame::Data {
                stream_id: self.shared.stream_id,
                payload: Bytes::copy_from_slice(chunk),
            };

            self.shared
                .frame_tx
                .send(Message::Binary(frame.encode()))
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Half-close: the peer observes end of stream after the data already sent
    pub async fn finish(&mut self) -> TransportResult<()> {
        if self.shared.fin_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let frame = Frame::Fin {
            stream_id: self.shared.stream_id,
        };
        self.shared
            .frame_tx
            .send(Message::Binary(frame.encode()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        debug!("Stream {} finished sending", self.shared.stream_id);
        Ok(())
    }

    /// Abort the stream in both directions
    pub async fn reset(&mut self) {
        if self.shared.reset.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.send_credit.close();

        let frame = Frame::Rst {
            stream_id: self.shared.stream_id,
        };
        let _ = self
            .shared
            .frame_tx
            .send(Message::Binary(frame.encode()))
            .await;
    }
}

/// Receiving half of a [`MuxStream`]
#[derive(Debug)]
pub struct MuxRecvHalf {
    shared: Arc<StreamShared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    /// Bytes consumed but not yet returned to the peer as credit
    unacked: u32,
    done: bool,
}

impl MuxRecvHalf {
    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id
    }

    /// Receive the next chunk of data
    ///
    /// Returns `Ok(None)` once the peer has finished its side, and an error
    /// if the stream was reset or the connection was lost.
    pub async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }

        match self.events.recv().await {
            Some(StreamEvent::Data(data)) => {
                self.release_credit(data.len() as u32).await?;
                Ok(Some(data))
            }
            Some(StreamEvent::Fin) => {
                self.done = true;
                self.shared.fin_received.store(true, Ordering::SeqCst);
                Ok(None)
            }
            Some(StreamEvent::Reset) => {
                self.done = true;
                self.shared.reset.store(true, Ordering::SeqCst);
                Err(TransportError::StreamReset)
            }
            None => {
                self.done = true;
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    async fn release_credit(&mut self, consumed: u32) -> TransportResult<()> {
        self.unacked += consumed;
        if self.unacked < INITIAL_WINDOW / 2 {
            return Ok(());
        }

        let increment = std::mem::take(&mut self.unacked);
        self.shared.recv_window.fetch_add(increment, Ordering::SeqCst);

        let frame = Frame::WindowUpdate {
            stream_id: self.shared.stream_id,
            increment,
        };
        self.shared
            .frame_tx
            .send(Message::Binary(frame.encode()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
