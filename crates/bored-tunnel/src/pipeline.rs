//! Secure Stream Pipeline
//!
//! One pipeline serves one logical stream:
//!
//! ```text
//! Opened -> AwaitingHandshake -> KeyEstablished -> BackendDialing -> Relaying -> Closed
//! ```
//!
//! Inbound bytes are decrypted record by record, optionally rewritten by the
//! impersonation stage, and written to the backend. Backend bytes are sealed
//! into records and sent back on the stream. Both directions run
//! concurrently, and each side's end of input half-closes the other side.

use bored_crypto::{
    AgentIdentity, Direction, HeaderCodec, RecordOpener, RecordSealer, StreamKeyMaterial,
    MAX_RECORD_PLAINTEXT,
};
use bored_impersonation::{ImpersonationFilter, ImpersonationStage};
use bored_transport::{MuxRecvHalf, MuxSendHalf, MuxStream};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::{BackendDialer, PipelineError};

/// Collaborators shared by every pipeline of a session
pub struct PipelineContext {
    pub identity: Arc<AgentIdentity>,
    pub header_codec: Arc<dyn HeaderCodec>,
    pub backend: Arc<BackendDialer>,
    /// Present only when impersonation is fully configured
    pub impersonation: Option<Arc<dyn ImpersonationFilter>>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("identity", &self.identity)
            .field("backend", &self.backend)
            .field("impersonation", &self.impersonation.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Opened,
    AwaitingHandshake,
    KeyEstablished,
    BackendDialing,
    Relaying,
    Closed,
}

/// Plaintext byte counts of a finished stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

pub struct SecureStreamPipeline {
    ctx: Arc<PipelineContext>,
    stream_id: u32,
    state: PipelineState,
}

impl SecureStreamPipeline {
    pub fn new(ctx: Arc<PipelineContext>, stream_id: u32) -> Self {
        Self {
            ctx,
            stream_id,
            state: PipelineState::Opened,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Serve the stream to completion
    ///
    /// Any failure resets this stream only.
    pub async fn run(mut self, stream: MuxStream) -> Result<RelayStats, PipelineError> {
        let (mut send, mut recv) = stream.split();
        debug!(stream_id = self.stream_id, "Stream opened");

        let result = self.drive(&mut send, &mut recv).await;
        self.transition(PipelineState::Closed);

        match &result {
            Ok(stats) => info!(
                stream_id = self.stream_id,
                bytes_to_backend = stats.bytes_to_backend,
                bytes_from_backend = stats.bytes_from_backend,
                "Stream closed"
            ),
            Err(e) => {
                warn!(stream_id = self.stream_id, error = %e, "Stream failed");
                send.reset().await;
            }
        }

        result
    }

    async fn drive(
        &mut self,
        send: &mut MuxSendHalf,
        recv: &mut MuxRecvHalf,
    ) -> Result<RelayStats, PipelineError> {
        self.transition(PipelineState::AwaitingHandshake);
        let mut pending = BytesMut::new();
        let material = self.await_handshake(recv, &mut pending).await?;

        self.transition(PipelineState::KeyEstablished);
        let opener =
            RecordOpener::new(&material, Direction::Inbound).map_err(PipelineError::Record)?;
        let sealer =
            RecordSealer::new(&material, Direction::Outbound).map_err(PipelineError::Record)?;
        drop(material);
        let stage = self.ctx.impersonation.as_ref().map(|filter| filter.new_stage());

        self.transition(PipelineState::BackendDialing);
        let backend = self.ctx.backend.dial().await?;

        self.transition(PipelineState::Relaying);
        let (backend_read, backend_write) = tokio::io::split(backend);

        let (bytes_to_backend, bytes_from_backend) = tokio::try_join!(
            relay_inbound(recv, pending, opener, stage, backend_write),
            relay_outbound(backend_read, sealer, send),
        )?;

        Ok(RelayStats {
            bytes_to_backend,
            bytes_from_backend,
        })
    }

    /// Read until the header codec yields key material
    ///
    /// Bytes after the envelope stay in `pending`; nothing is forwarded
    /// before the handshake completes.
    async fn await_handshake(
        &self,
        recv: &mut MuxRecvHalf,
        pending: &mut BytesMut,
    ) -> Result<StreamKeyMaterial, PipelineError> {
        loop {
            if let Some(material) = self
                .ctx
                .header_codec
                .decode(pending, &self.ctx.identity)
                .map_err(PipelineError::Handshake)?
            {
                return Ok(material);
            }

            match recv.recv().await? {
                Some(data) => pending.extend_from_slice(&data),
                None => return Err(PipelineError::HandshakeIncomplete),
            }
        }
    }

    fn transition(&mut self, next: PipelineState) {
        trace!(
            stream_id = self.stream_id,
            "Pipeline {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Broker to backend: decrypt, optionally impersonate, write
async fn relay_inbound<W>(
    recv: &mut MuxRecvHalf,
    mut pending: BytesMut,
    mut opener: RecordOpener,
    mut stage: Option<Box<dyn ImpersonationStage>>,
    mut backend: W,
) -> Result<u64, PipelineError>
where
    W: AsyncWrite + Unpin,
{
    let mut forwarded = 0u64;

    loop {
        let mut wrote = false;
        while let Some(plaintext) = opener
            .open_next(&mut pending)
            .map_err(PipelineError::Record)?
        {
            let bytes = match stage.as_mut() {
                Some(stage) => stage.process(&plaintext)?,
                None => Bytes::from(plaintext),
            };
            if !bytes.is_empty() {
                backend.write_all(&bytes).await?;
                forwarded += bytes.len() as u64;
                wrote = true;
            }
        }
        if wrote {
            backend.flush().await?;
        }

        match recv.recv().await? {
            Some(data) => pending.extend_from_slice(&data),
            None => break,
        }
    }

    if !pending.is_empty() {
        return Err(PipelineError::TruncatedRecord);
    }

    backend.shutdown().await?;
    trace!(stream_id = recv.stream_id(), "Backend write side closed");
    Ok(forwarded)
}

/// Backend to broker: seal and send
async fn relay_outbound<R>(
    mut backend: R,
    mut sealer: RecordSealer,
    send: &mut MuxSendHalf,
) -> Result<u64, PipelineError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_RECORD_PLAINTEXT];
    let mut relayed = 0u64;

    loop {
        let n = match backend.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            // Backends commonly close without close_notify
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };

        let sealed = sealer.seal(&buf[..n]).map_err(PipelineError::Record)?;
        send.send(&sealed).await?;
        relayed += n as u64;
    }

    send.finish().await?;
    trace!(stream_id = send.stream_id(), "Stream write side closed");
    Ok(relayed)
}
