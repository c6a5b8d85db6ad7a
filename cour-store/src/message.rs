use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cour_stream::{FilterMode, FilterStream, SharedStream, Stream, StreamFlags, StreamRef};

use crate::attribute::Attributes;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::header::Headers;

/// Codec applied when serving a stored body back to the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BodyCodec {
    /// Raw bytes (maildir).
    None,
    /// mbox `>From` quoting.
    Fromrb,
    /// dotmail dot-stuffing.
    Dot,
}

impl BodyCodec {
    fn filter_name(self) -> Option<&'static str> {
        match self {
            BodyCodec::None => None,
            BodyCodec::Fromrb => Some("FROMRB"),
            BodyCodec::Dot => Some("DOT"),
        }
    }
}

/// Where a message's bytes live.
#[derive(Clone)]
pub struct MessageSource {
    pub stream: SharedStream,
    pub header_start: u64,
    pub header_len: u64,
    pub body_start: u64,
    pub body_len: u64,
    pub codec: BodyCodec,
}

/// Shared token that inerts all handles when the mailbox session ends.
#[derive(Default)]
pub struct SessionTether {
    detached: AtomicBool,
}

impl SessionTether {
    pub fn new() -> Arc<SessionTether> {
        Arc::new(SessionTether::default())
    }

    /// Called by the mailbox on close; outstanding handles turn inert
    /// instead of dangling.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// Public, lazily-materialized view of one stored message.
///
/// The handle holds parsed headers and envelope plus bounded windows
/// into the mailbox stream; it cannot outlive the open session that
/// produced it — once the mailbox closes, all I/O returns
/// [`Error::Detached`].
#[derive(Clone)]
pub struct MessageHandle {
    ordinal: usize,
    uid: u32,
    attrs: Attributes,
    envelope: Envelope,
    headers: Arc<Headers>,
    source: MessageSource,
    tether: Arc<SessionTether>,
}

impl MessageHandle {
    pub fn new(
        ordinal: usize,
        uid: u32,
        attrs: Attributes,
        envelope: Envelope,
        headers: Headers,
        source: MessageSource,
        tether: Arc<SessionTether>,
    ) -> MessageHandle {
        MessageHandle {
            ordinal,
            uid,
            attrs,
            envelope,
            headers: Arc::new(headers),
            source,
            tether,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn attributes(&self) -> Attributes {
        self.attrs
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    fn check_attached(&self) -> Result<()> {
        if self.tether.is_detached() {
            Err(Error::Detached)
        } else {
            Ok(())
        }
    }

    /// Raw header block as a bounded stream window.
    pub async fn header_stream(&self) -> Result<Stream> {
        self.check_attached()?;
        Ok(StreamRef::new(
            self.source.stream.clone(),
            self.source.header_start,
            Some(self.source.header_len),
        )
        .open_stream(StreamFlags::READ)
        .await?)
    }

    /// Decoded body stream.
    pub async fn body_stream(&self) -> Result<Stream> {
        self.check_attached()?;
        let raw = StreamRef::new(
            self.source.stream.clone(),
            self.source.body_start,
            Some(self.source.body_len),
        )
        .open_stream(StreamFlags::READ)
        .await?;
        match self.source.codec.filter_name() {
            None => Ok(raw),
            Some(name) => Ok(FilterStream::create(
                raw,
                name,
                FilterMode::Decode,
                StreamFlags::READ,
            )
            .await?),
        }
    }

    /// Convenience: decoded body bytes.
    pub async fn read_body(&self) -> Result<Vec<u8>> {
        let mut stream = self.body_stream().await?;
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Stored size of header block plus body, in bytes.
    pub fn stored_size(&self) -> u64 {
        self.source.header_len + self.source.body_len
    }

    /// The Content-Type value, for multipart dispatch.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    /// When the message is `multipart/*`, scan its decoded body and
    /// return a part reader; `None` for single-part messages.
    pub async fn multipart(&self) -> Result<Option<cour_mime::MultipartReader>> {
        let content_type = match self.content_type() {
            Some(ct) if cour_mime::is_multipart(ct) => ct.to_string(),
            _ => return Ok(None),
        };
        let body = self.body_stream().await?.into_shared();
        Ok(Some(
            cour_mime::MultipartReader::from_content_type(body, &content_type).await?,
        ))
    }
}

/// A message on its way into a mailbox.
///
/// Carries the raw RFC 822 bytes plus optional envelope and initial
/// attributes. Engines strip any `X-IMAPbase`, `X-UID` and `Status`
/// headers found in the raw form and re-synthesize their own.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    raw: Vec<u8>,
    pub envelope: Option<Envelope>,
    pub attrs: Attributes,
}

impl OutgoingMessage {
    /// Build from complete message bytes (headers, blank line, body).
    pub fn from_bytes(raw: impl Into<Vec<u8>>) -> OutgoingMessage {
        OutgoingMessage {
            raw: raw.into(),
            envelope: None,
            attrs: Attributes::empty(),
        }
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> OutgoingMessage {
        self.envelope = Some(envelope);
        self
    }

    pub fn with_attributes(mut self, attrs: Attributes) -> OutgoingMessage {
        self.attrs = attrs;
        self
    }

    fn split(&self) -> (&[u8], &[u8]) {
        // Blank line separates headers from body.
        let mut i = 0;
        while i < self.raw.len() {
            let line_end = self.raw[i..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| i + p + 1)
                .unwrap_or(self.raw.len());
            if &self.raw[i..line_end] == b"\n" {
                return (&self.raw[..i], &self.raw[line_end..]);
            }
            i = line_end;
        }
        (&self.raw[..], &[])
    }

    pub fn header_bytes(&self) -> &[u8] {
        self.split().0
    }

    pub fn body(&self) -> &[u8] {
        self.split().1
    }

    pub fn headers(&self) -> Headers {
        Headers::parse(self.header_bytes())
    }

    /// The envelope to put on the From_ line: the explicit one if set,
    /// otherwise reconstructed from the headers.
    pub fn resolved_envelope(&self) -> Envelope {
        match &self.envelope {
            Some(env) => env.clone(),
            None => Envelope::reconstruct(&self.headers()),
        }
    }
}
