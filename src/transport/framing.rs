//! Length-prefixed envelope framing for raw byte streams
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! envelope JSON. Lengths of zero or above [`MAX_FRAME_SIZE`] are rejected
//! before any payload is read.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Connection, ProtocolError, TransportError, TransportResult};
use crate::message::Envelope;

/// Largest accepted frame payload (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Deadline for reading one envelope
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for writing one envelope
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(ProtocolError::EmptyFrame.into());
    }
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
pub async fn read_frame<R>(reader: &mut R) -> TransportResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Disconnected)
        }
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        return Err(ProtocolError::EmptyFrame.into());
    }
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(payload),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Disconnected)
        }
        Err(e) => Err(e.into()),
    }
}

/// An envelope connection over any byte stream
pub struct FramedConnection<S> {
    stream: S,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream with the default deadlines
    pub fn new(stream: S) -> Self {
        FramedConnection {
            stream,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    /// Override the per-envelope read deadline
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, envelope: &Envelope) -> TransportResult<()> {
        let payload = envelope
            .to_json()
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        tokio::time::timeout(self.write_timeout, write_frame(&mut self.stream, &payload))
            .await
            .map_err(|_| TransportError::Timeout(self.write_timeout))?
    }

    async fn receive(&mut self) -> TransportResult<Envelope> {
        let payload = tokio::time::timeout(self.read_timeout, read_frame(&mut self.stream))
            .await
            .map_err(|_| TransportError::Timeout(self.read_timeout))??;
        Envelope::from_json(&payload)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()).into())
    }

    async fn close(&mut self) -> TransportResult<()> {
        let shutdown = tokio::time::timeout(self.write_timeout, self.stream.shutdown())
            .await
            .map_err(|_| TransportError::Timeout(self.write_timeout))?;
        match shutdown {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;

    #[tokio::test]
    async fn test_envelope_round_trip() {
        let (left, right) = tokio::io::duplex(4096);
        let mut sender = FramedConnection::new(left);
        let mut receiver = FramedConnection::new(right);

        let envelope = Envelope::new("a", "b", kind::MESSAGE, "over the wire");
        sender.send(&envelope).await.unwrap();

        assert_eq!(receiver.receive().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_payload() {
        let (mut left, mut right) = tokio::io::duplex(64);

        // only the header is ever written
        left.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();

        match read_frame(&mut right).await {
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge { len, max })) => {
                assert_eq!(len, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let (mut left, mut right) = tokio::io::duplex(64);
        left.write_u32(0).await.unwrap();

        assert!(matches!(
            read_frame(&mut right).await,
            Err(TransportError::Protocol(ProtocolError::EmptyFrame))
        ));
        assert!(write_frame(&mut left, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_max_size_frame_accepted() {
        let (mut left, mut right) = tokio::io::duplex(MAX_FRAME_SIZE + 16);
        let payload = vec![b'x'; MAX_FRAME_SIZE];

        write_frame(&mut left, &payload).await.unwrap();
        assert_eq!(read_frame(&mut right).await.unwrap().len(), MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (mut left, right) = tokio::io::duplex(64);
        write_frame(&mut left, b"{not json").await.unwrap();

        let mut receiver = FramedConnection::new(right);
        assert!(matches!(
            receiver.receive().await,
            Err(TransportError::Protocol(ProtocolError::MalformedEnvelope(_)))
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup() {
        let (left, right) = tokio::io::duplex(64);
        drop(left);

        let mut receiver = FramedConnection::new(right);
        assert!(matches!(
            receiver.receive().await,
            Err(TransportError::Disconnected)
        ));
    }

    /// Reads and writes nothing, and never finishes shutting down
    struct StuckStream;

    impl AsyncRead for StuckStream {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    impl AsyncWrite for StuckStream {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Pending
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_deadline() {
        let mut stuck = FramedConnection::new(StuckStream);
        assert!(matches!(
            stuck.close().await,
            Err(TransportError::Timeout(d)) if d == WRITE_TIMEOUT
        ));

        let (left, _right) = tokio::io::duplex(64);
        assert!(FramedConnection::new(left).close().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (_left, right) = tokio::io::duplex(64);
        let mut receiver = FramedConnection::new(right).with_read_timeout(Duration::from_secs(5));

        assert!(matches!(
            receiver.receive().await,
            Err(TransportError::Timeout(d)) if d == Duration::from_secs(5)
        ));
    }
}
