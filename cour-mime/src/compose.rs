use async_trait::async_trait;
use rand::Rng;

use cour_stream::{
    BufferMode, NullStream, SharedStream, Stream, StreamFlags, StreamImpl,
};

use crate::Result;

/// Boundary of the form `<rand>-<pid>=:<seq>`, unlikely to occur in any
/// part body.
pub fn generate_boundary(seq: usize) -> String {
    let r: u32 = rand::thread_rng().gen();
    format!("{}-{}=:{}", r, std::process::id(), seq)
}

enum BodySource {
    Bytes(Vec<u8>),
    Stream(SharedStream),
}

struct Part {
    header: Vec<u8>,
    body: BodySource,
}

/// Assembles a composite multipart body.
///
/// Parts are kept in insertion order. [`MultipartBuilder::into_stream`]
/// yields a readable, seekable stream that interleaves boundary lines,
/// part headers and part bodies, closed by the final `--boundary--`
/// delimiter.
pub struct MultipartBuilder {
    boundary: String,
    parts: Vec<Part>,
}

impl MultipartBuilder {
    pub fn new() -> MultipartBuilder {
        MultipartBuilder {
            boundary: generate_boundary(0),
            parts: Vec::new(),
        }
    }

    pub fn with_boundary(boundary: &str) -> MultipartBuilder {
        MultipartBuilder {
            boundary: boundary.to_string(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Content-Type value describing this composite.
    pub fn content_type(&self, subtype: &str) -> String {
        format!("multipart/{}; boundary=\"{}\"", subtype, self.boundary)
    }

    pub fn count(&self) -> usize {
        self.parts.len()
    }

    /// Add a part from raw header bytes (without the terminating blank
    /// line) and an in-memory body.
    pub fn add_part_bytes(&mut self, header: &[u8], body: &[u8]) {
        self.parts.push(Part {
            header: header.to_vec(),
            body: BodySource::Bytes(body.to_vec()),
        });
    }

    /// Add a part whose body is read from a shared stream at composition
    /// time.
    pub fn add_part_stream(&mut self, header: &[u8], body: SharedStream) {
        self.parts.push(Part {
            header: header.to_vec(),
            body: BodySource::Stream(body),
        });
    }

    /// Produce the composite body stream.
    pub async fn into_stream(self) -> Result<Stream> {
        let imp = CompositeStream {
            boundary: self.boundary,
            parts: self.parts,
            cursor: Cursor::default(),
        };
        let mut stream = Stream::new(Box::new(imp), StreamFlags::READ | StreamFlags::SEEK)
            .buffered(BufferMode::Full, 0);
        stream.open().await?;
        Ok(stream)
    }
}

impl Default for MultipartBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
enum Section {
    #[default]
    Delimiter,
    Header,
    Body,
    CloseDelimiter,
    Done,
}

#[derive(Clone, Copy, Default)]
struct Cursor {
    part: usize,
    section: Section,
    /// Byte offset within the current section's rendered bytes.
    offset: usize,
    /// Logical position of the whole composite, for seek bookkeeping.
    position: u64,
}

struct CompositeStream {
    boundary: String,
    parts: Vec<Part>,
    cursor: Cursor,
}

impl CompositeStream {
    fn delimiter(&self) -> Vec<u8> {
        format!("--{}\n", self.boundary).into_bytes()
    }

    fn close_delimiter(&self) -> Vec<u8> {
        format!("--{}--\n", self.boundary).into_bytes()
    }

    /// Header section bytes: raw headers plus the separating blank line.
    fn header_bytes(&self, part: usize) -> Vec<u8> {
        let mut out = self.parts[part].header.clone();
        if !out.is_empty() && !out.ends_with(b"\n") {
            out.push(b'\n');
        }
        out.push(b'\n');
        out
    }

    async fn read_section(&mut self, out: &mut [u8]) -> cour_stream::Result<usize> {
        loop {
            if self.parts.is_empty() {
                self.cursor.section = Section::Done;
            }
            match self.cursor.section {
                Section::Delimiter => {
                    let bytes = self.delimiter();
                    let n = copy_tail(&bytes, self.cursor.offset, out);
                    if n > 0 {
                        self.cursor.offset += n;
                        return Ok(n);
                    }
                    self.cursor.section = Section::Header;
                    self.cursor.offset = 0;
                }
                Section::Header => {
                    let bytes = self.header_bytes(self.cursor.part);
                    let n = copy_tail(&bytes, self.cursor.offset, out);
                    if n > 0 {
                        self.cursor.offset += n;
                        return Ok(n);
                    }
                    self.cursor.section = Section::Body;
                    self.cursor.offset = 0;
                }
                Section::Body => {
                    let n = match &mut self.parts[self.cursor.part].body {
                        BodySource::Bytes(data) => {
                            let n = copy_tail(data, self.cursor.offset, out);
                            self.cursor.offset += n;
                            n
                        }
                        BodySource::Stream(shared) => {
                            let mut guard = shared.lock().await;
                            guard
                                .seek(std::io::SeekFrom::Start(self.cursor.offset as u64))
                                .await?;
                            let n = guard.read(out).await?;
                            self.cursor.offset += n;
                            n
                        }
                    };
                    if n > 0 {
                        return Ok(n);
                    }
                    // Part body exhausted; a newline separates it from
                    // the next delimiter line.
                    if self.cursor.part + 1 < self.parts.len() {
                        self.cursor.part += 1;
                        self.cursor.section = Section::Delimiter;
                    } else {
                        self.cursor.section = Section::CloseDelimiter;
                    }
                    self.cursor.offset = 0;
                    if !out.is_empty() {
                        out[0] = b'\n';
                        return Ok(1);
                    }
                }
                Section::CloseDelimiter => {
                    let bytes = self.close_delimiter();
                    let n = copy_tail(&bytes, self.cursor.offset, out);
                    if n > 0 {
                        self.cursor.offset += n;
                        return Ok(n);
                    }
                    self.cursor.section = Section::Done;
                }
                Section::Done => return Ok(0),
            }
        }
    }
}

fn copy_tail(src: &[u8], offset: usize, out: &mut [u8]) -> usize {
    if offset >= src.len() {
        return 0;
    }
    let n = (src.len() - offset).min(out.len());
    out[..n].copy_from_slice(&src[offset..offset + n]);
    n
}

#[async_trait]
impl StreamImpl for CompositeStream {
    async fn read(&mut self, buf: &mut [u8]) -> cour_stream::Result<usize> {
        let n = self.read_section(buf).await?;
        self.cursor.position += n as u64;
        Ok(n)
    }

    async fn write(&mut self, _buf: &[u8]) -> cour_stream::Result<usize> {
        Err(cour_stream::Error::NotSupported("write"))
    }

    /// `seek(0)` rewinds; any other target rewinds and discards bytes
    /// into a null stream until the target is reached. Linear, but the
    /// composite stays seekable from the caller's point of view.
    async fn seek(&mut self, pos: u64) -> cour_stream::Result<u64> {
        self.cursor = Cursor::default();
        if pos == 0 {
            return Ok(0);
        }
        let mut sink = Stream::new(Box::new(NullStream::new()), StreamFlags::WRITE);
        sink.open().await?;
        let mut remaining = pos;
        let mut chunk = [0u8; 4096];
        while remaining > 0 {
            let want = (remaining as usize).min(chunk.len());
            let n = self.read_section(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&chunk[..n]).await?;
            self.cursor.position += n as u64;
            remaining -= n as u64;
        }
        Ok(self.cursor.position)
    }

    async fn size(&mut self) -> cour_stream::Result<u64> {
        // Render-length computation: delimiters, headers, bodies and the
        // separating newlines.
        let mut total = 0u64;
        let delim = self.delimiter().len() as u64;
        for (i, part) in self.parts.iter().enumerate() {
            total += delim;
            total += self.header_bytes(i).len() as u64;
            total += match &part.body {
                BodySource::Bytes(data) => data.len() as u64,
                BodySource::Stream(shared) => {
                    let mut guard = shared.lock().await;
                    guard.size().await?
                }
            };
            total += 1; // newline owned by the encapsulation
        }
        total += self.close_delimiter().len() as u64;
        Ok(total)
    }

    fn seekable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::MultipartReader;
    use cour_stream::MemStream;

    async fn read_all(s: &mut Stream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = s.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    #[tokio::test]
    async fn composes_delimited_parts() {
        let mut b = MultipartBuilder::with_boundary("BB");
        b.add_part_bytes(b"Content-Type: text/plain\n", b"hello\n");
        b.add_part_bytes(b"Content-Type: text/html\n", b"<i>hi</i>\n");
        let mut s = b.into_stream().await.unwrap();
        let out = read_all(&mut s).await;
        assert_eq!(
            out,
            b"--BB\nContent-Type: text/plain\n\nhello\n\n--BB\nContent-Type: text/html\n\n<i>hi</i>\n\n--BB--\n".as_slice()
        );
    }

    #[tokio::test]
    async fn composite_parses_back() {
        let mut b = MultipartBuilder::new();
        b.add_part_bytes(b"X: 1\n", b"alpha");
        b.add_part_bytes(b"X: 2\n", b"beta\ngamma\n");
        let boundary = b.boundary().to_string();
        let mut s = b.into_stream().await.unwrap();
        let bytes = read_all(&mut s).await;

        let mut src = Stream::new(
            Box::new(MemStream::from(bytes)),
            StreamFlags::READ | StreamFlags::SEEK,
        );
        src.open().await.unwrap();
        let rd = MultipartReader::parse(src.into_shared(), &boundary)
            .await
            .unwrap();
        assert_eq!(rd.count(), 2);
        let mut b0 = rd.part_body_stream(0).await.unwrap();
        assert_eq!(read_all(&mut b0).await, b"alpha");
        let mut b1 = rd.part_body_stream(1).await.unwrap();
        assert_eq!(read_all(&mut b1).await, b"beta\ngamma\n");
    }

    #[tokio::test]
    async fn seek_zero_rewinds_and_nonzero_discards() {
        let mut b = MultipartBuilder::with_boundary("Q");
        b.add_part_bytes(b"H: v\n", b"0123456789");
        let mut s = b.into_stream().await.unwrap();
        let all = read_all(&mut s).await;
        s.seek(std::io::SeekFrom::Start(0)).await.unwrap();
        let again = read_all(&mut s).await;
        assert_eq!(all, again);
        s.seek(std::io::SeekFrom::Start(5)).await.unwrap();
        let tail = read_all(&mut s).await;
        assert_eq!(&tail[..], &all[5..]);
    }

    #[tokio::test]
    async fn stream_bodies_are_read_at_composition_time() {
        let mut body = Stream::new(
            Box::new(MemStream::from(b"streamed body".to_vec())),
            StreamFlags::READ | StreamFlags::SEEK,
        );
        body.open().await.unwrap();
        let mut b = MultipartBuilder::with_boundary("S");
        b.add_part_stream(b"H: v\n", body.into_shared());
        let mut s = b.into_stream().await.unwrap();
        let out = read_all(&mut s).await;
        assert_eq!(out, b"--S\nH: v\n\nstreamed body\n--S--\n".as_slice());
    }
}
