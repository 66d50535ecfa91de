//! The 64-byte-maximum framing layer.
//!
//! A frame is a one-byte header followed by 0..63 payload bytes. The header
//! packs a final-message flag, a channel selector, and the payload length.
//! Frames are self-delimiting: no out-of-band length prefix is needed to
//! find the next frame in a byte stream.
//!
//! This module keeps the pure, synchronous framing logic (`Header`,
//! `Frame`, `FrameEncoder`, `FrameDecoder`) separate from the async
//! transport glue (`FramedWriter`/`FramedReader`) so the former can be
//! property-tested without a runtime.

use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload bytes a single frame may carry.
pub const MAX_PAYLOAD: usize = 63;

/// The two logical streams multiplexed over one byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Carries command completions, in submission order.
    Response,
    /// Carries asynchronous VM/PPUX events.
    Notification,
}

impl Channel {
    fn bit(self) -> u8 {
        match self {
            Channel::Response => 0,
            Channel::Notification => 1,
        }
    }

    fn from_bit(bit: u8) -> Channel {
        if bit & 1 == 0 {
            Channel::Response
        } else {
            Channel::Notification
        }
    }
}

/// The one-byte frame header: `F` (bit 7) final flag, `C` (bit 6) channel,
/// `L` (bits 5..0) payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub is_final: bool,
    pub channel: Channel,
    pub len: u8,
}

impl Header {
    /// Builds a header, rejecting a length outside 0..=63.
    pub fn new(is_final: bool, channel: Channel, len: u8) -> Result<Header, FrameError> {
        if len as usize > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }
        Ok(Header {
            is_final,
            channel,
            len,
        })
    }

    pub fn encode(self) -> u8 {
        ((self.is_final as u8) << 7) | (self.channel.bit() << 6) | (self.len & 0x3F)
    }

    pub fn decode(byte: u8) -> Header {
        Header {
            is_final: (byte >> 7) & 1 == 1,
            channel: Channel::from_bit((byte >> 6) & 1),
            len: byte & 0x3F,
        }
    }
}

/// A single wire frame: header plus its payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_final(&self) -> bool {
        self.header.is_final
    }

    pub fn channel(&self) -> Channel {
        self.header.channel
    }

    /// Serializes this frame to its wire representation (header byte + payload).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.extend_from_slice(&[self.header.encode()]);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload length {0} exceeds the 63-byte frame maximum")]
    PayloadTooLarge(u8),

    #[error("not enough data buffered for a complete frame")]
    Incomplete,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Accumulates written bytes into 63-byte frames for a single channel.
///
/// Not reentrant: a caller that needs to interleave multiple in-flight
/// messages on the same channel must serialize access (the dispatcher does
/// this with a mutex held for the full logical message).
#[derive(Debug)]
pub struct FrameEncoder {
    channel: Channel,
    buf: [u8; MAX_PAYLOAD],
    pos: usize,
}

impl FrameEncoder {
    pub fn new(channel: Channel) -> FrameEncoder {
        FrameEncoder {
            channel,
            buf: [0u8; MAX_PAYLOAD],
            pos: 0,
        }
    }

    /// Feeds `bytes` into the internal buffer, returning zero or more
    /// non-final frames emitted along the way. A full buffer is *not*
    /// flushed if it exactly exhausts the input — that last full frame is
    /// deferred to `finalize` so every message ends in exactly one
    /// `is_final` frame.
    pub fn write(&mut self, mut bytes: &[u8]) -> Vec<Frame> {
        let mut emitted = Vec::new();
        while !bytes.is_empty() {
            let space = MAX_PAYLOAD - self.pos;
            let n = space.min(bytes.len());
            self.buf[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
            self.pos += n;
            bytes = &bytes[n..];

            if self.pos >= MAX_PAYLOAD && !bytes.is_empty() {
                emitted.push(self.flush_full());
            }
        }
        emitted
    }

    /// Emits exactly one frame with `is_final = true` carrying whatever
    /// remains in the buffer (possibly zero bytes), then resets.
    pub fn finalize(&mut self) -> Frame {
        let header = Header::new(true, self.channel, self.pos as u8)
            .expect("internal buffer never exceeds MAX_PAYLOAD");
        let payload = Bytes::copy_from_slice(&self.buf[..self.pos]);
        self.pos = 0;
        Frame { header, payload }
    }

    fn flush_full(&mut self) -> Frame {
        let header = Header::new(false, self.channel, self.pos as u8)
            .expect("internal buffer never exceeds MAX_PAYLOAD");
        let payload = Bytes::copy_from_slice(&self.buf[..self.pos]);
        self.pos = 0;
        header_to_frame(header, payload)
    }
}

fn header_to_frame(header: Header, payload: Bytes) -> Frame {
    Frame { header, payload }
}

/// Parses complete frames out of a growing byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
        }
    }

    /// Appends newly received bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame, if one is buffered. An
    /// under-length source frame (fewer bytes available than the header's
    /// declared `L`) is not an error — it simply returns `Ok(None)`.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let header = Header::decode(self.buf[0]);
        let total = 1 + header.len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame_bytes = self.buf.split_to(total);
        let payload = frame_bytes.split_off(1).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

/// Async-transport wrapper around [`FrameEncoder`], writing completed
/// frames straight through to the sink and flushing once per logical
/// write call.
#[derive(Debug)]
pub struct FramedWriter<W> {
    sink: W,
    encoder: FrameEncoder,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(sink: W, channel: Channel) -> FramedWriter<W> {
        FramedWriter {
            sink,
            encoder: FrameEncoder::new(channel),
        }
    }

    #[tracing::instrument(skip(self, bytes))]
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        for frame in self.encoder.write(bytes) {
            self.sink.write_all(&frame.to_bytes()).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn finalize(&mut self) -> Result<(), FrameError> {
        let frame = self.encoder.finalize();
        self.sink.write_all(&frame.to_bytes()).await?;
        self.sink.flush().await?;
        Ok(())
    }
}

/// Async-transport wrapper around [`FrameDecoder`], pulling bytes from the
/// source only when the buffered data isn't enough to complete a frame.
#[derive(Debug)]
pub struct FramedReader<R> {
    source: R,
    decoder: FrameDecoder,
    read_buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(source: R) -> FramedReader<R> {
        FramedReader {
            source,
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads the next frame, or `None` on a clean end-of-stream between
    /// frames. An EOF that cuts a frame in half is a hard error.
    #[tracing::instrument(skip(self))]
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(frame) = self.decoder.read_frame()? {
                return Ok(Some(frame));
            }

            self.read_buf.clear();
            let n = self.source.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.read_buf);
        }
    }
}
