//! Framed codec for the worker pipes.
//!
//! Every frame is a 16-byte ASCII header followed by the body: `%08x` body length, then
//! `%08x` of `length * 2 - 1`. The second field is a cheap consistency check against
//! truncated or misaligned reads, not a hash.
//!
//! Bodies written by the worker additionally have `\`, CR and LF escaped as two-byte
//! sequences; the host side undoes that before handing the body on. Host bodies are
//! literal text, which never contains raw CR or LF.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 16;

/// Largest body whose check field still fits in eight hex digits.
pub const MAX_BODY_LEN: usize = 0x8000_0000;

/// Blocking reads never ask the pipe for more than this at once.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid frame header {0:?}")]
    BadHeader(String),
    #[error("body length {0} cannot be framed")]
    BadLength(usize),
}

/// Which end of the pipe this codec sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Body(usize),
}

#[derive(Debug)]
pub struct FrameCodec {
    side: Side,
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            state: DecodeState::Head,
        }
    }

    pub fn host() -> Self {
        Self::new(Side::Host)
    }

    pub fn worker() -> Self {
        Self::new(Side::Worker)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Bytes that must be buffered before `decode` can make progress.
    pub fn bytes_needed(&self, buffered: usize) -> usize {
        match self.state {
            DecodeState::Head => HEADER_LEN.saturating_sub(buffered),
            DecodeState::Body(len) => len.saturating_sub(buffered),
        }
    }

    fn reset(&mut self) {
        self.state = DecodeState::Head;
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.state == DecodeState::Head {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let len = decode_header(&src[..HEADER_LEN])?;
            src.advance(HEADER_LEN);
            self.state = DecodeState::Body(len);
        }

        let DecodeState::Body(len) = self.state else {
            return Ok(None);
        };
        if src.len() < len {
            return Ok(None);
        }

        let body = src.split_to(len);
        self.state = DecodeState::Head;
        tracing::trace!(len, "Decoded frame");

        Ok(Some(match self.side {
            Side::Host => unescape_body(&body).freeze(),
            Side::Worker => body.freeze(),
        }))
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, body: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = match self.side {
            Side::Host => Cow::Borrowed(body),
            Side::Worker => Cow::Owned(escape_body(body)),
        };
        let header = encode_header(body.len())?;
        tracing::trace!(len = body.len(), "Encoding frame");

        dst.reserve(HEADER_LEN + body.len());
        dst.put_slice(&header);
        dst.put_slice(&body);
        Ok(())
    }
}

pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN], CodecError> {
    if len == 0 || len > MAX_BODY_LEN {
        return Err(CodecError::BadLength(len));
    }
    let text = format!("{:08x}{:08x}", len, len * 2 - 1);
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Validate a header and return the body length it declares.
pub fn decode_header(header: &[u8]) -> Result<usize, CodecError> {
    let bad = || CodecError::BadHeader(String::from_utf8_lossy(header).into_owned());
    if header.len() != HEADER_LEN {
        return Err(bad());
    }

    let (len_field, check_field) = header.split_at(8);
    let (Some(len), Some(check)) = (parse_hex(len_field), parse_hex(check_field)) else {
        return Err(bad());
    };
    if i64::from(len) * 2 - 1 != i64::from(check) {
        return Err(bad());
    }
    Ok(len as usize)
}

fn parse_hex(field: &[u8]) -> Option<u32> {
    if !field.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    u32::from_str_radix(std::str::from_utf8(field).ok()?, 16).ok()
}

pub fn escape_body(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for &b in body {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }
    out
}

/// Inverse of [`escape_body`]; unknown escapes pass through untouched.
pub fn unescape_body(body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i] == b'\\' && i + 1 < body.len() {
            let replacement = match body[i + 1] {
                b'\\' => Some(b'\\'),
                b'r' => Some(b'\r'),
                b'n' => Some(b'\n'),
                _ => None,
            };
            if let Some(b) = replacement {
                out.put_u8(b);
                i += 2;
                continue;
            }
        }
        out.put_u8(body[i]);
        i += 1;
    }
    out
}

/// Read exactly one frame, never consuming bytes past its end.
pub fn read_frame<R: Read + ?Sized>(
    codec: &mut FrameCodec,
    reader: &mut R,
) -> Result<Bytes, CodecError> {
    let result = read_frame_inner(codec, reader);
    if result.is_err() {
        codec.reset();
    }
    result
}

fn read_frame_inner<R: Read + ?Sized>(
    codec: &mut FrameCodec,
    reader: &mut R,
) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    loop {
        if let Some(frame) = codec.decode(&mut buf)? {
            return Ok(frame);
        }
        let step = codec.bytes_needed(buf.len()).min(READ_CHUNK);
        let start = buf.len();
        buf.resize(start + step, 0);
        reader.read_exact(&mut buf[start..])?;
    }
}

/// Frame `body` and write it out in one go.
pub fn write_frame<W: Write + ?Sized>(
    codec: &mut FrameCodec,
    writer: &mut W,
    body: &[u8],
) -> Result<(), CodecError> {
    let mut buf = BytesMut::new();
    codec.encode(body, &mut buf)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}
