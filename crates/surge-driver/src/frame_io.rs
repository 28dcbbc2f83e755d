// Framed I/O over TCP byte streams.
use anyhow::{Context, Result, bail};
use bytes::{Buf, BytesMut};
use surge_wire::{Frame, HEADER_LEN, parse_header};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard safety cap for any single frame.
///
/// The reader allocates buffer space based on the advertised payload length;
/// without a cap a buggy peer could advertise an enormous length and trigger
/// OOM.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Buffered frame reader over a byte stream.
///
/// `next_frame` is cancel-safe: bytes already pulled off the socket stay in
/// the internal buffer, so the demultiplexer may race a read against its
/// shutdown signal without corrupting the stream.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(frame);
            }
            let read = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .context("read frame bytes")?;
            if read == 0 {
                bail!("connection closed mid-stream");
            }
        }
    }

    fn try_parse(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let (flags, length) = parse_header(&self.buf).context("decode frame header")?;
        if length > MAX_FRAME_BYTES {
            bail!("frame too large: {length} bytes (cap {MAX_FRAME_BYTES}); refusing");
        }
        if self.buf.len() < HEADER_LEN + length {
            self.buf.reserve(HEADER_LEN + length - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(length).freeze();
        Ok(Some(Frame { flags, payload }))
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer
        .write_all(&frame.encode())
        .await
        .context("write frame")
}
