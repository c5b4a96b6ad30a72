//! Newline-delimited envelope codec for the request-response protocol
//!
//! Each stream carries exactly one request envelope and one response
//! (ack) envelope, each a single JSON line of at most [`MAX_LINE_SIZE`]
//! bytes.

use std::io;

use async_trait::async_trait;
use futures_util::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use libp2p::request_response;
use libp2p::StreamProtocol;

use crate::message::Envelope;

/// Stream protocol id for envelope exchange
pub const PROTOCOL: StreamProtocol = StreamProtocol::new("/murmur/1.0.0");

/// Largest accepted envelope line, newline excluded
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Reads and writes one JSON envelope line per direction
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

async fn read_envelope<T>(io: &mut T) -> io::Result<Envelope>
where
    T: AsyncRead + Unpin + Send,
{
    let mut line = Vec::new();
    let limit = (MAX_LINE_SIZE + 1) as u64;
    BufReader::new(io.take(limit)).read_until(b'\n', &mut line).await?;

    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > MAX_LINE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("envelope line exceeds {MAX_LINE_SIZE} bytes"),
        ));
    }
    if line.is_empty() {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }

    Envelope::from_json(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_envelope<T>(io: &mut T, envelope: &Envelope) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let mut line = envelope
        .to_json()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    io.write_all(&line).await?;
    io.flush().await
}

#[async_trait]
impl request_response::Codec for EnvelopeCodec {
    type Protocol = StreamProtocol;
    type Request = Envelope;
    type Response = Envelope;

    async fn read_request<T>(&mut self, _protocol: &StreamProtocol, io: &mut T) -> io::Result<Envelope>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_envelope(io).await
    }

    async fn read_response<T>(&mut self, _protocol: &StreamProtocol, io: &mut T) -> io::Result<Envelope>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_envelope(io).await
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &StreamProtocol,
        io: &mut T,
        request: Envelope,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_envelope(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &StreamProtocol,
        io: &mut T,
        response: Envelope,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_envelope(io, &response).await?;
        io.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;
    use futures_util::io::Cursor;
    use libp2p::request_response::Codec;

    #[tokio::test]
    async fn test_line_round_trip() {
        let envelope = Envelope::new("a", "b", kind::MESSAGE, "line\nbreaks are escaped");
        let mut codec = EnvelopeCodec;

        let mut written = Cursor::new(Vec::new());
        codec
            .write_request(&PROTOCOL, &mut written, envelope.clone())
            .await
            .unwrap();
        let bytes = written.into_inner();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

        let mut reader = Cursor::new(bytes);
        let read = codec.read_request(&PROTOCOL, &mut reader).await.unwrap();
        assert_eq!(read, envelope);
    }

    #[tokio::test]
    async fn test_missing_newline_accepted_at_eof() {
        let envelope = Envelope::new("a", "b", kind::PING, "");
        let mut reader = Cursor::new(envelope.to_json().unwrap());

        let read = EnvelopeCodec
            .read_response(&PROTOCOL, &mut reader)
            .await
            .unwrap();
        assert_eq!(read, envelope);
    }

    #[tokio::test]
    async fn test_oversized_and_empty_lines() {
        let mut oversized = Cursor::new(vec![b'x'; MAX_LINE_SIZE + 10]);
        let err = EnvelopeCodec
            .read_request(&PROTOCOL, &mut oversized)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut empty = Cursor::new(Vec::new());
        let err = EnvelopeCodec
            .read_request(&PROTOCOL, &mut empty)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
