//! Framed transport with per-cycle sequence tracking
//!
//! `PacketIo` turns a byte stream into logical MySQL packets. It validates the
//! sequence id of every packet it reads and stamps the ones it writes; the
//! counter is reset by the owner at the start of each command cycle.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PacketIoError;
use crate::protocol::{Packet, PacketCodec, MAX_PACKET_SIZE};

/// Upper bound for the shutdown handshake on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Any bidirectional byte stream the transport can own
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Closes a `PacketIo` from another task
///
/// Pending and later reads/writes on the transport fail with
/// `PacketIoError::ConnectionClosed`. The owner still releases the stream.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    closed: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Framed MySQL transport owned by exactly one side of one session
pub struct PacketIo {
    /// `None` once closed or after a failed TLS upgrade
    framed: Option<Framed<BoxedStream, PacketCodec>>,
    sequence: u8,
    remote_addr: String,
    tls: bool,
    closed: CancellationToken,
}

impl PacketIo {
    pub fn new<S>(stream: S, remote_addr: impl Into<String>) -> Self
    where
        S: AsyncStream + 'static,
    {
        Self::with_codec(stream, remote_addr, PacketCodec::default())
    }

    pub fn with_codec<S>(stream: S, remote_addr: impl Into<String>, codec: PacketCodec) -> Self
    where
        S: AsyncStream + 'static,
    {
        let stream: BoxedStream = Box::new(stream);
        Self {
            framed: Some(Framed::new(stream, codec)),
            sequence: 0,
            remote_addr: remote_addr.into(),
            tls: false,
            closed: CancellationToken::new(),
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Sequence id expected on the next read and stamped on the next write
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new command cycle
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn is_closed(&self) -> bool {
        self.framed.is_none() || self.closed.is_cancelled()
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closed: self.closed.clone(),
        }
    }

    /// Read one logical packet, joining payloads split at `MAX_PACKET_SIZE`
    pub async fn read_packet(&mut self) -> Result<Bytes, PacketIoError> {
        let first = self.read_sequenced().await?;
        if first.len() < MAX_PACKET_SIZE {
            return Ok(first);
        }

        let mut payload = BytesMut::from(&first[..]);
        loop {
            let next = self.read_sequenced().await?;
            payload.extend_from_slice(&next);
            if next.len() < MAX_PACKET_SIZE {
                return Ok(payload.freeze());
            }
        }
    }

    /// Buffer one logical packet; call `flush` to put it on the wire
    pub async fn write_packet(&mut self, payload: Bytes) -> Result<(), PacketIoError> {
        let mut rest = payload;
        loop {
            let chunk_len = rest.len().min(MAX_PACKET_SIZE);
            let chunk = rest.split_to(chunk_len);
            self.write_physical(chunk).await?;
            // A payload that is an exact multiple ends with an empty packet
            if chunk_len < MAX_PACKET_SIZE {
                return Ok(());
            }
        }
    }

    pub async fn flush(&mut self) -> Result<(), PacketIoError> {
        let framed = self.framed.as_mut().ok_or(PacketIoError::ConnectionClosed)?;
        until_closed(&self.closed, SinkExt::<Packet>::flush(framed)).await
    }

    /// Write one logical packet and flush it
    pub async fn write_and_flush(&mut self, payload: Bytes) -> Result<(), PacketIoError> {
        self.write_packet(payload).await?;
        self.flush().await
    }

    /// Switch to TLS as the server side of the handshake
    pub async fn upgrade_to_tls_server(
        &mut self,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<(), PacketIoError> {
        let (io, codec) = self.take_for_upgrade()?;
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        let stream = until_closed(&self.closed, async move {
            acceptor
                .accept(io)
                .await
                .map_err(|e| PacketIoError::Tls(e.to_string()))
        })
        .await?;

        self.install(Box::new(stream), codec);
        debug!(remote_addr = %self.remote_addr, "Upgraded client connection to TLS");
        Ok(())
    }

    /// Switch to TLS as the client side of the handshake
    pub async fn upgrade_to_tls_client(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<(), PacketIoError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| PacketIoError::Tls(format!("invalid server name '{}'", server_name)))?;

        let (io, codec) = self.take_for_upgrade()?;
        let connector = tokio_rustls::TlsConnector::from(config);
        let stream = until_closed(&self.closed, async move {
            connector
                .connect(name, io)
                .await
                .map_err(|e| PacketIoError::Tls(e.to_string()))
        })
        .await?;

        self.install(Box::new(stream), codec);
        debug!(remote_addr = %self.remote_addr, "Upgraded backend connection to TLS");
        Ok(())
    }

    /// Release the stream. Later calls are no-ops.
    pub async fn close(&mut self) -> Result<(), PacketIoError> {
        self.closed.cancel();
        let Some(framed) = self.framed.take() else {
            return Ok(());
        };

        // Unflushed bytes are dropped; every response is flushed before this point.
        let mut io = framed.into_inner();
        match tokio::time::timeout(CLOSE_TIMEOUT, io.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let err = PacketIoError::Io(e);
                if err.is_disconnect() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(_) => Err(PacketIoError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out shutting down connection",
            ))),
        }
    }

    async fn read_sequenced(&mut self) -> Result<Bytes, PacketIoError> {
        let packet = self.read_physical().await?;
        if packet.sequence_id != self.sequence {
            return Err(PacketIoError::InvalidSequence {
                expected: self.sequence,
                got: packet.sequence_id,
            });
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(packet.payload)
    }

    async fn read_physical(&mut self) -> Result<Packet, PacketIoError> {
        let framed = self.framed.as_mut().ok_or(PacketIoError::ConnectionClosed)?;
        until_closed(&self.closed, async {
            match framed.next().await {
                Some(result) => result,
                None => Err(PacketIoError::ConnectionClosed),
            }
        })
        .await
    }

    async fn write_physical(&mut self, chunk: Bytes) -> Result<(), PacketIoError> {
        let packet = Packet::new(self.sequence, chunk);
        self.sequence = self.sequence.wrapping_add(1);
        let framed = self.framed.as_mut().ok_or(PacketIoError::ConnectionClosed)?;
        until_closed(&self.closed, framed.feed(packet)).await
    }

    /// Unwrap the stream for a TLS handshake. Bytes the codec already read
    /// past the last packet (a ClientHello sent right behind the SSL request)
    /// are replayed to the handshake.
    fn take_for_upgrade(&mut self) -> Result<(BoxedStream, PacketCodec), PacketIoError> {
        if self.closed.is_cancelled() {
            return Err(PacketIoError::ConnectionClosed);
        }
        let framed = self.framed.take().ok_or(PacketIoError::ConnectionClosed)?;
        let parts = framed.into_parts();
        if !parts.write_buf.is_empty() {
            return Err(PacketIoError::Protocol(
                "unflushed data before TLS handshake".into(),
            ));
        }
        let io: BoxedStream = if parts.read_buf.is_empty() {
            parts.io
        } else {
            Box::new(Rewind {
                prefix: parts.read_buf.freeze(),
                inner: parts.io,
            })
        };
        Ok((io, parts.codec))
    }

    fn install(&mut self, stream: BoxedStream, codec: PacketCodec) {
        self.framed = Some(Framed::new(stream, codec));
        self.tls = true;
    }
}

/// Yields `prefix` before reading from `inner` again; writes go straight through
struct Rewind {
    prefix: Bytes,
    inner: BoxedStream,
}

impl AsyncRead for Rewind {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() && buf.remaining() > 0 {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn until_closed<F, T>(closed: &CancellationToken, fut: F) -> Result<T, PacketIoError>
where
    F: Future<Output = Result<T, PacketIoError>>,
{
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(PacketIoError::ConnectionClosed),
        result = fut => result,
    }
}
