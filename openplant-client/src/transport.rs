//! Framed transport halves.
//!
//! The reader answers heartbeat records inline through the shared writer, so
//! callers only ever see data frames.

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use openplant_protocol::frame::{DecodedFrame, FrameDecoder, FrameEncoder, ECHO_BYTE};
use openplant_protocol::{CompressMode, Request};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Default socket read chunk (8 KiB).
pub const DEFAULT_READ_CHUNK: usize = 8 * 1024;

/// Minimum socket read chunk (1 KiB).
pub const MIN_READ_CHUNK: usize = 1024;

/// Maximum socket read chunk (1 MiB).
pub const MAX_READ_CHUNK: usize = 1024 * 1024;

/// A writer shared between request senders and the heartbeat responder.
pub type SharedWriter<W> = Arc<Mutex<FrameWriter<W>>>;

/// Writes framed messages and raw control bytes.
pub struct FrameWriter<W> {
    io: W,
    encoder: FrameEncoder,
    out: BytesMut,
    body: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, page_size: usize, mode: CompressMode) -> Self {
        Self {
            io,
            encoder: FrameEncoder::new(page_size, mode),
            out: BytesMut::with_capacity(page_size),
            body: BytesMut::new(),
        }
    }

    pub fn into_shared(self) -> SharedWriter<W> {
        Arc::new(Mutex::new(self))
    }

    pub fn mode(&self) -> CompressMode {
        self.encoder.mode()
    }

    pub fn set_mode(&mut self, mode: CompressMode) {
        self.encoder.set_mode(mode);
    }

    /// Sends `payload` as one logical message and flushes.
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.out.clear();
        let frames = self.encoder.encode_message(payload, &mut self.out)?;
        tracing::trace!(frames, bytes = payload.len(), "writing message");
        self.io.write_all(&self.out).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Encodes and sends a request.
    pub async fn write_request(&mut self, request: &Request) -> Result<(), ClientError> {
        let mut body = std::mem::take(&mut self.body);
        body.clear();
        let res = match request.encode(&mut body) {
            Ok(()) => self.write_message(&body).await,
            Err(e) => Err(e.into()),
        };
        self.body = body;
        res
    }

    /// Writes bytes outside any frame (heartbeat records and echoes).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Reads frames, answering heartbeats as they arrive.
pub struct FrameReader<R, W> {
    io: R,
    decoder: FrameDecoder,
    buf: BytesMut,
    chunk: usize,
    echo: SharedWriter<W>,
    heartbeats: Arc<AtomicU64>,
}

impl<R, W> FrameReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(io: R, echo: SharedWriter<W>, chunk: usize) -> Self {
        let chunk = chunk.clamp(MIN_READ_CHUNK, MAX_READ_CHUNK);
        Self {
            io,
            decoder: FrameDecoder::new(),
            buf: BytesMut::with_capacity(chunk),
            chunk,
            echo,
            heartbeats: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of heartbeats answered so far.
    pub fn heartbeats_answered(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    pub fn heartbeat_counter(&self) -> Arc<AtomicU64> {
        self.heartbeats.clone()
    }

    async fn fill(&mut self) -> Result<(), ClientError> {
        self.buf.reserve(self.chunk);
        let n = self.io.read_buf(&mut self.buf).await?;
        if n == 0 {
            tracing::debug!("peer closed the connection");
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }

    /// Reads exactly `n` raw bytes (login packets, echo replies).
    pub async fn read_raw(&mut self, n: usize) -> Result<Bytes, ClientError> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        Ok(self.buf.split_to(n).freeze())
    }

    async fn answer_heartbeat(&mut self) -> Result<(), ClientError> {
        self.echo.lock().await.write_raw(&[ECHO_BYTE]).await?;
        let n = self.heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(answered = n, "answered heartbeat");
        Ok(())
    }

    /// Reads the next data frame, returning its payload and eof flag.
    pub async fn read_frame(&mut self) -> Result<(Bytes, bool), ClientError> {
        loop {
            match self.decoder.decode(&mut self.buf)? {
                Some(DecodedFrame::Heartbeat(_)) => self.answer_heartbeat().await?,
                Some(DecodedFrame::Data { eof, payload, .. }) => return Ok((payload, eof)),
                None => self.fill().await?,
            }
        }
    }

    /// Waits for the echo byte answering our heartbeat. Heartbeats the peer
    /// queued ahead of it are answered; a data frame there means the stream
    /// is out of step.
    pub async fn read_echo(&mut self) -> Result<(), ClientError> {
        loop {
            match self.buf.first().copied() {
                None => self.fill().await?,
                Some(ECHO_BYTE) => {
                    let _ = self.buf.split_to(1);
                    return Ok(());
                }
                Some(_) => match self.decoder.decode(&mut self.buf)? {
                    Some(DecodedFrame::Heartbeat(_)) => self.answer_heartbeat().await?,
                    Some(DecodedFrame::Data { payload, .. }) => {
                        tracing::warn!(bytes = payload.len(), "data frame where echo expected");
                        return Err(ClientError::Broken);
                    }
                    None => self.fill().await?,
                },
            }
        }
    }

    /// Reads frames up to and including the eof frame.
    pub async fn read_message(&mut self) -> Result<BytesMut, ClientError> {
        let mut message = BytesMut::new();
        loop {
            let (payload, eof) = self.read_frame().await?;
            message.extend_from_slice(&payload);
            if eof {
                return Ok(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openplant_protocol::frame::{heartbeat_record, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type Halves = (
        FrameReader<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
        SharedWriter<WriteHalf<DuplexStream>>,
    );

    fn halves(stream: DuplexStream, page_size: usize, mode: CompressMode) -> Halves {
        let (r, w) = split(stream);
        let writer = FrameWriter::new(w, page_size, mode).into_shared();
        (FrameReader::new(r, writer.clone(), MIN_READ_CHUNK), writer)
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (a, b) = duplex(1 << 20);
        let (_, writer) = halves(a, MIN_PAGE_SIZE, CompressMode::Lz4Block);
        let (mut reader, _) = halves(b, MIN_PAGE_SIZE, CompressMode::Raw);

        let payload: Vec<u8> = b"realtime ".iter().copied().cycle().take(10_000).collect();
        writer.lock().await.write_message(&payload).await.unwrap();
        let back = reader.read_message().await.unwrap();
        assert_eq!(&back[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_heartbeat_answered_transparently() {
        let (client, server) = duplex(1 << 16);
        let (mut reader, _) = halves(client, DEFAULT_PAGE_SIZE, CompressMode::Raw);
        let (mut server_r, mut server_w) = split(server);

        let mut enc = FrameEncoder::new(DEFAULT_PAGE_SIZE, CompressMode::Raw);
        let mut wire = BytesMut::new();
        enc.encode_message(b"after heartbeat", &mut wire).unwrap();
        server_w.write_all(&heartbeat_record()).await.unwrap();
        server_w.write_all(&wire).await.unwrap();

        let message = reader.read_message().await.unwrap();
        assert_eq!(&message[..], b"after heartbeat");
        assert_eq!(reader.heartbeats_answered(), 1);

        let mut echo = [0u8; 1];
        server_r.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, [ECHO_BYTE]);
    }

    #[tokio::test]
    async fn test_raw_then_framed() {
        let (client, server) = duplex(1 << 16);
        let (mut reader, _) = halves(client, DEFAULT_PAGE_SIZE, CompressMode::Raw);
        let (_, mut server_w) = split(server);

        let mut enc = FrameEncoder::new(DEFAULT_PAGE_SIZE, CompressMode::Raw);
        let mut wire = BytesMut::from(&[7u8; 16][..]);
        enc.encode_message(b"body", &mut wire).unwrap();
        server_w.write_all(&wire).await.unwrap();

        assert_eq!(&reader.read_raw(16).await.unwrap()[..], &[7u8; 16]);
        assert_eq!(&reader.read_message().await.unwrap()[..], b"body");
    }

    #[tokio::test]
    async fn test_heartbeat_split_across_reads() {
        let mut enc = FrameEncoder::new(DEFAULT_PAGE_SIZE, CompressMode::Raw);
        let mut wire = BytesMut::new();
        enc.encode_message(b"rows", &mut wire).unwrap();
        let hb = heartbeat_record();

        let rd = tokio_test::io::Builder::new()
            .read(&hb[..3])
            .read(&hb[3..])
            .read(&wire[..2])
            .read(&wire[2..])
            .build();
        let wr = tokio_test::io::Builder::new().write(&[ECHO_BYTE]).build();
        let echo = FrameWriter::new(wr, DEFAULT_PAGE_SIZE, CompressMode::Raw).into_shared();
        let mut reader = FrameReader::new(rd, echo, MIN_READ_CHUNK);

        let (payload, eof) = reader.read_frame().await.unwrap();
        assert!(eof);
        assert_eq!(&payload[..], b"rows");
        assert_eq!(reader.heartbeat_counter().load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_echo_after_queued_heartbeat() {
        let hb = heartbeat_record();
        let rd = tokio_test::io::Builder::new()
            .read(&hb[..])
            .read(&[ECHO_BYTE])
            .build();
        let wr = tokio_test::io::Builder::new().write(&[ECHO_BYTE]).build();
        let echo = FrameWriter::new(wr, DEFAULT_PAGE_SIZE, CompressMode::Raw).into_shared();
        let mut reader = FrameReader::new(rd, echo, MIN_READ_CHUNK);

        reader.read_echo().await.unwrap();
        assert_eq!(reader.heartbeats_answered(), 1);
    }

    #[tokio::test]
    async fn test_echo_with_data_frame_ahead() {
        let (client, server) = duplex(1 << 16);
        let (mut reader, _) = halves(client, DEFAULT_PAGE_SIZE, CompressMode::Raw);
        let (_, mut server_w) = split(server);

        let mut enc = FrameEncoder::new(DEFAULT_PAGE_SIZE, CompressMode::Raw);
        let mut wire = BytesMut::new();
        enc.encode_message(b"stray", &mut wire).unwrap();
        wire.extend_from_slice(&[ECHO_BYTE]);
        server_w.write_all(&wire).await.unwrap();

        assert!(matches!(reader.read_echo().await, Err(ClientError::Broken)));
    }

    #[tokio::test]
    async fn test_closed_peer() {
        let (client, server) = duplex(64);
        let (mut reader, _) = halves(client, DEFAULT_PAGE_SIZE, CompressMode::Raw);
        drop(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}
