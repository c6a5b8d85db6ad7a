use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::stream::{BufferMode, Stream, StreamFlags, StreamImpl};

mod base64;
mod crlf;
mod dot;
mod fromrb;
mod qp;
mod rfc2047;

pub use base64::{Base64Decode, Base64Encode};
pub use crlf::{CrlfDecode, CrlfEncode};
pub use dot::{DotDecode, DotEncode};
pub use fromrb::{FromrbDecode, FromrbEncode};
pub use qp::{QpDecode, QpEncode};
pub use rfc2047::{FallbackPolicy, Rfc2047Codec};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterMode {
    Encode,
    Decode,
}

/// A line-oriented transform. Implementations may hold back bytes of a
/// partial sequence between `transform` calls and must emit them from
/// `finish`.
pub trait Codec: Send {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()>;

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// Logical end-of-stream reached inside the data (DOT terminator).
    fn finished(&self) -> bool {
        false
    }
}

type CodecCtor = fn(FilterMode) -> Box<dyn Codec>;

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, CodecCtor> = {
        let mut m: HashMap<&'static str, CodecCtor> = HashMap::new();
        m.insert("CRLF", |mode| match mode {
            FilterMode::Encode => Box::new(CrlfEncode::new()),
            FilterMode::Decode => Box::new(CrlfDecode::new()),
        });
        m.insert("DOT", |mode| match mode {
            FilterMode::Encode => Box::new(DotEncode::new()),
            FilterMode::Decode => Box::new(DotDecode::new()),
        });
        m.insert("FROMRB", |mode| match mode {
            FilterMode::Encode => Box::new(FromrbEncode::new()),
            FilterMode::Decode => Box::new(FromrbDecode::new()),
        });
        m.insert("BASE64", |mode| match mode {
            FilterMode::Encode => Box::new(Base64Encode::new()),
            FilterMode::Decode => Box::new(Base64Decode::new()),
        });
        m.insert("QUOTED-PRINTABLE", |mode| match mode {
            FilterMode::Encode => Box::new(QpEncode::new()),
            FilterMode::Decode => Box::new(QpDecode::new()),
        });
        m.insert("RFC2047", |mode| Box::new(Rfc2047Codec::new(mode, "UTF-8", FallbackPolicy::CopyPass)));
        m
    };
}

/// Look a codec up by name, case-insensitively.
pub fn create_codec(name: &str, mode: FilterMode) -> Result<Box<dyn Codec>> {
    let key = name.to_ascii_uppercase();
    match REGISTRY.get(key.as_str()) {
        Some(ctor) => Ok(ctor(mode)),
        None => Err(Error::NoCodec(name.to_string())),
    }
}

/// A stream applying a codec over an inner stream.
///
/// Reading pulls raw bytes from the inner stream and serves transformed
/// output; writing transforms and pushes through. With
/// [`StreamFlags::RDTHRU`] set on the filter, reads bypass the codec.
pub struct FilterStream {
    inner: Stream,
    codec: Box<dyn Codec>,
    pending: Vec<u8>,
    served: usize,
    source_eof: bool,
    drained: bool,
    /// Reads bypass the codec (RDTHRU on a write-side filter).
    read_through: bool,
}

impl FilterStream {
    pub fn new(inner: Stream, codec: Box<dyn Codec>) -> FilterStream {
        FilterStream {
            inner,
            codec,
            pending: Vec::new(),
            served: 0,
            source_eof: false,
            drained: false,
            read_through: false,
        }
    }

    /// Filter an inner stream by codec name.
    pub async fn create(
        inner: Stream,
        name: &str,
        mode: FilterMode,
        flags: StreamFlags,
    ) -> Result<Stream> {
        let codec = create_codec(name, mode)?;
        let mut filter = FilterStream::new(inner, codec);
        filter.read_through = flags.contains(StreamFlags::RDTHRU);
        let mut stream = Stream::new(Box::new(filter), flags).buffered(BufferMode::Full, 0);
        stream.open().await?;
        Ok(stream)
    }

    pub fn into_inner(self) -> Stream {
        self.inner
    }
}

#[async_trait]
impl StreamImpl for FilterStream {
    async fn open(&mut self) -> Result<()> {
        if !self.inner.is_open() {
            self.inner.open().await?;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.read_through {
            return self.inner.read(buf).await;
        }
        let mut chunk = [0u8; 4096];
        loop {
            if self.served < self.pending.len() {
                let avail = &self.pending[self.served..];
                let n = avail.len().min(buf.len());
                buf[..n].copy_from_slice(&avail[..n]);
                self.served += n;
                if self.served == self.pending.len() {
                    self.pending.clear();
                    self.served = 0;
                }
                return Ok(n);
            }
            if self.drained || self.codec.finished() {
                return Ok(0);
            }
            if self.source_eof {
                self.codec.finish(&mut self.pending)?;
                self.drained = true;
                continue;
            }
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.source_eof = true;
                continue;
            }
            self.codec.transform(&chunk[..n], &mut self.pending)?;
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut out = Vec::with_capacity(buf.len() + buf.len() / 8);
        self.codec.transform(buf, &mut out)?;
        self.inner.write_all(&out).await?;
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<()> {
        let mut out = Vec::new();
        self.codec.finish(&mut out)?;
        if !out.is_empty() {
            self.inner.write_all(&out).await?;
        }
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        // Flush any codec hold-back before closing the transport.
        let mut out = Vec::new();
        self.codec.finish(&mut out)?;
        if !out.is_empty() {
            self.inner.write_all(&out).await?;
        }
        self.inner.close().await
    }
}
