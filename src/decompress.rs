//! Manual `Content-Encoding` decoding backed by pooled decoders.
//!
//! The transport never decodes bodies itself. [`decompress`] swaps a
//! response's raw body for a [`DecodedBody`] that borrows a decoder from a
//! process-wide pool and hands it back as soon as the stream ends or the body
//! is dropped.
//!
//! Decoded output is produced in chunks of at most [`DECODED_CHUNK_SIZE`]
//! bytes, and network input is only pulled when the decoder has run dry, so a
//! small compressed chunk never expands into one large allocation.

use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{Buf, Bytes, BytesMut};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::StatusCode;
use hyper::body::HttpBody;
use hyper::Body;

use crate::error::{Error, Result};
use crate::pool::{Pool, Pooled, Reset};
use crate::response::{Response, ResponseBody};

/// Largest decoded chunk a [`DecodedBody`] yields at once
pub const DECODED_CHUNK_SIZE: usize = 32 * 1024;

const BROTLI_BUFFER_SIZE: usize = 4096;
const MAX_IDLE_DECODERS: usize = 32;

/// Supported content codings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
    Brotli,
}

impl Encoding {
    /// Parse a `Content-Encoding` value; `None` for identity and unknown codings
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "br" => Some(Encoding::Brotli),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
        }
    }
}

/// Compressed bytes not yet consumed by a decoder.
///
/// Reading an empty queue fails with `WouldBlock` until the raw body has
/// ended, so a decoder stops and hands control back whenever it needs more
/// network input.
#[derive(Clone, Default)]
struct PendingInput(Arc<Mutex<InputState>>);

#[derive(Default)]
struct InputState {
    buf: BytesMut,
    ended: bool,
}

impl PendingInput {
    fn push(&self, data: &[u8]) {
        if let Ok(mut state) = self.0.lock() {
            state.buf.extend_from_slice(data);
        }
    }

    fn end(&self) {
        if let Ok(mut state) = self.0.lock() {
            state.ended = true;
        }
    }

    fn clear(&self) {
        if let Ok(mut state) = self.0.lock() {
            state.buf.clear();
            state.ended = false;
        }
    }
}

impl Read for PendingInput {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut state = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "decoder input poisoned"))?;
        if state.buf.is_empty() {
            return if state.ended {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = out.len().min(state.buf.len());
        out[..n].copy_from_slice(&state.buf[..n]);
        state.buf.advance(n);
        Ok(n)
    }
}

/// Wire format a pooled decoder handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Gzip,
    Zlib,
    RawDeflate,
    Brotli,
}

enum Inflater {
    Gzip(MultiGzDecoder<PendingInput>),
    Zlib(ZlibDecoder<PendingInput>),
    RawDeflate(DeflateDecoder<PendingInput>),
    Brotli(Box<brotli::Decompressor<PendingInput>>),
}

impl Inflater {
    fn new(format: Format, input: PendingInput) -> Self {
        match format {
            Format::Gzip => Inflater::Gzip(MultiGzDecoder::new(input)),
            Format::Zlib => Inflater::Zlib(ZlibDecoder::new(input)),
            Format::RawDeflate => Inflater::RawDeflate(DeflateDecoder::new(input)),
            Format::Brotli => Inflater::Brotli(Box::new(brotli::Decompressor::new(input, BROTLI_BUFFER_SIZE))),
        }
    }

    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            Inflater::Gzip(decoder) => decoder.read(out),
            Inflater::Zlib(decoder) => decoder.read(out),
            Inflater::RawDeflate(decoder) => decoder.read(out),
            Inflater::Brotli(decoder) => decoder.read(out),
        }
    }
}

/// One decompression stream with its input queue and output scratch space
struct StreamDecoder {
    format: Format,
    input: PendingInput,
    inflater: Inflater,
    scratch: Vec<u8>,
}

impl StreamDecoder {
    fn new(format: Format) -> Self {
        let input = PendingInput::default();
        Self {
            format,
            inflater: Inflater::new(format, input.clone()),
            input,
            scratch: vec![0; DECODED_CHUNK_SIZE],
        }
    }

    /// Decode the next chunk from queued input; `Ok(None)` at the end of
    /// the stream, `WouldBlock` when more input is needed
    fn decode(&mut self) -> io::Result<Option<Bytes>> {
        match self.inflater.read(&mut self.scratch)? {
            0 => Ok(None),
            n => Ok(Some(Bytes::copy_from_slice(&self.scratch[..n]))),
        }
    }
}

impl Reset for StreamDecoder {
    fn reset(&mut self) {
        self.input.clear();
        let rebuild = match &mut self.inflater {
            Inflater::Zlib(decoder) => {
                decoder.reset(self.input.clone());
                false
            }
            Inflater::RawDeflate(decoder) => {
                decoder.reset(self.input.clone());
                false
            }
            // gzip member state and brotli windows cannot be rewound
            Inflater::Gzip(_) | Inflater::Brotli(_) => true,
        };
        if rebuild {
            self.inflater = Inflater::new(self.format, self.input.clone());
        }
    }
}

impl fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDecoder").field("format", &self.format).finish()
    }
}

fn pool(format: Format) -> &'static Pool<StreamDecoder> {
    static GZIP: OnceLock<Pool<StreamDecoder>> = OnceLock::new();
    static ZLIB: OnceLock<Pool<StreamDecoder>> = OnceLock::new();
    static RAW_DEFLATE: OnceLock<Pool<StreamDecoder>> = OnceLock::new();
    static BROTLI: OnceLock<Pool<StreamDecoder>> = OnceLock::new();
    match format {
        Format::Gzip => GZIP.get_or_init(|| Pool::new(|| StreamDecoder::new(Format::Gzip), MAX_IDLE_DECODERS)),
        Format::Zlib => ZLIB.get_or_init(|| Pool::new(|| StreamDecoder::new(Format::Zlib), MAX_IDLE_DECODERS)),
        Format::RawDeflate => {
            RAW_DEFLATE.get_or_init(|| Pool::new(|| StreamDecoder::new(Format::RawDeflate), MAX_IDLE_DECODERS))
        }
        Format::Brotli => BROTLI.get_or_init(|| Pool::new(|| StreamDecoder::new(Format::Brotli), MAX_IDLE_DECODERS)),
    }
}

/// Number of idle pooled decoders for `encoding`
pub fn idle_decoders(encoding: Encoding) -> usize {
    match encoding {
        Encoding::Gzip => pool(Format::Gzip).idle(),
        Encoding::Deflate => pool(Format::Zlib).idle() + pool(Format::RawDeflate).idle(),
        Encoding::Brotli => pool(Format::Brotli).idle(),
    }
}

fn is_zlib_header(cmf: u8, flg: u8) -> bool {
    cmf & 0x0f == 8 && cmf >> 4 <= 7 && ((u16::from(cmf) << 8) | u16::from(flg)) % 31 == 0
}

enum Codec {
    Ready(Pooled<StreamDecoder>),
    /// Deflate body whose first two bytes have not arrived yet
    Sniffing(Vec<u8>),
}

impl Codec {
    fn checkout(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Gzip => Codec::Ready(pool(Format::Gzip).checkout()),
            Encoding::Brotli => Codec::Ready(pool(Format::Brotli).checkout()),
            Encoding::Deflate => Codec::Sniffing(Vec::with_capacity(2)),
        }
    }
}

/// Response body decoded on the fly.
///
/// Holds its decoder exclusively; the decoder returns to the pool when the
/// stream ends, fails, or the body is dropped.
pub struct DecodedBody {
    raw: Body,
    encoding: Encoding,
    codec: Option<Codec>,
    received: u64,
}

impl DecodedBody {
    /// Wrap `raw` with a decoder for `encoding` checked out of the pool
    pub fn new(raw: Body, encoding: Encoding) -> Self {
        Self {
            raw,
            encoding,
            codec: Some(Codec::checkout(encoding)),
            received: 0,
        }
    }

    /// Encoding being decoded
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Next decoded chunk, `None` at the end of the stream.
    ///
    /// Chunks are at most [`DECODED_CHUNK_SIZE`] bytes.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.codec.as_mut() {
                None => return Ok(None),
                Some(Codec::Ready(decoder)) => match decoder.decode() {
                    Ok(Some(chunk)) => return Ok(Some(chunk)),
                    Ok(None) => {
                        self.codec = None;
                        return Ok(None);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        self.codec = None;
                        return Err(Error::decompression(format!(
                            "invalid {} data: {}",
                            self.encoding.as_str(),
                            err
                        )));
                    }
                },
                Some(Codec::Sniffing(_)) => {}
            }

            match self.raw.data().await {
                Some(Ok(input)) => {
                    self.received += input.len() as u64;
                    self.push(&input);
                }
                Some(Err(err)) => {
                    self.codec = None;
                    return Err(Error::from_hyper(err));
                }
                None if self.received == 0 => {
                    self.codec = None;
                    return Ok(None);
                }
                None => self.end()?,
            }
        }
    }

    fn push(&mut self, input: &[u8]) {
        match &mut self.codec {
            Some(Codec::Ready(decoder)) => decoder.input.push(input),
            Some(Codec::Sniffing(head)) => {
                head.extend_from_slice(input);
                if head.len() >= 2 {
                    // Servers disagree on whether "deflate" means zlib or raw.
                    let format = if is_zlib_header(head[0], head[1]) {
                        Format::Zlib
                    } else {
                        Format::RawDeflate
                    };
                    let decoder = pool(format).checkout();
                    decoder.input.push(head);
                    self.codec = Some(Codec::Ready(decoder));
                }
            }
            None => {}
        }
    }

    fn end(&mut self) -> Result<()> {
        if let Some(Codec::Ready(decoder)) = &self.codec {
            decoder.input.end();
        } else if self.codec.is_some() {
            self.codec = None;
            return Err(Error::decompression("truncated deflate stream"));
        }
        Ok(())
    }
}

impl fmt::Debug for DecodedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedBody")
            .field("encoding", &self.encoding)
            .field("finished", &self.codec.is_none())
            .finish()
    }
}

/// Replace the response body with a decoding reader when it carries a
/// supported `Content-Encoding`.
///
/// On substitution `Content-Encoding` and `Content-Length` are removed and the
/// response is marked uncompressed. Absent or unknown encodings are left alone.
pub fn decompress(response: &mut Response) -> Result<()> {
    let Some(value) = response.headers().get(CONTENT_ENCODING) else {
        return Ok(());
    };
    let encoding = match value.to_str().ok().and_then(Encoding::from_header) {
        Some(encoding) => encoding,
        None => {
            tracing::debug!(encoding = ?value, "leaving body with unsupported content encoding");
            return Ok(());
        }
    };
    let status = response.status();
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(());
    }

    let raw = match response.take_body() {
        ResponseBody::Raw(body) => body,
        ResponseBody::Buffered(Some(bytes)) => Body::from(bytes),
        other => {
            response.set_body(other);
            return Ok(());
        }
    };
    response.set_body(ResponseBody::Decoded(DecodedBody::new(raw, encoding)));
    response.headers_mut().remove(CONTENT_ENCODING);
    response.headers_mut().remove(CONTENT_LENGTH);
    response.set_uncompressed(true);
    tracing::debug!(?encoding, "decoding response body");
    Ok(())
}
