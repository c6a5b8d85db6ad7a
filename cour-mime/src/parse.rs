use cour_stream::{SharedStream, Stream, StreamFlags, StreamRef};

use crate::{Error, Result};

/// True when a Content-Type value names a multipart type.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/")
}

/// Extract the `boundary` parameter from a Content-Type header value.
pub fn content_type_boundary(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            if value.is_empty() {
                return None;
            }
            return Some(value.to_string());
        }
    }
    None
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BoundaryMatch {
    No,
    Open,
    Close,
}

/// `--<boundary>`, optionally followed by `--`, then optional blanks.
fn match_boundary(line: &[u8], boundary: &[u8]) -> BoundaryMatch {
    let line = match line.strip_suffix(b"\n") {
        Some(l) => l.strip_suffix(b"\r").unwrap_or(l),
        None => line,
    };
    let rest = match line.strip_prefix(b"--") {
        Some(r) => r,
        None => return BoundaryMatch::No,
    };
    let rest = match rest.strip_prefix(boundary) {
        Some(r) => r,
        None => return BoundaryMatch::No,
    };
    let (close, rest) = match rest.strip_prefix(b"--") {
        Some(r) => (true, r),
        None => (false, rest),
    };
    if rest.iter().all(|b| *b == b' ' || *b == b'\t') {
        if close {
            BoundaryMatch::Close
        } else {
            BoundaryMatch::Open
        }
    } else {
        BoundaryMatch::No
    }
}

/// Offsets of one decoded part within the scanned stream.
#[derive(Clone, Debug)]
pub struct PartLocation {
    pub header_start: u64,
    pub header_len: u64,
    pub body_start: u64,
    pub body_len: u64,
    pub body_lines: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    ScanBoundary,
    Headers,
    End,
}

/// Boundary-driven multipart scanner.
///
/// The CRLF preceding a boundary line belongs to the boundary, not to
/// the part before it; part lengths and line counts account for that.
pub struct MultipartReader {
    source: SharedStream,
    boundary: String,
    parts: Vec<PartLocation>,
    epilogue_start: Option<u64>,
}

impl MultipartReader {
    /// Scan `source` (a message body stream positioned anywhere) using
    /// the boundary from the given Content-Type value.
    pub async fn from_content_type(source: SharedStream, content_type: &str) -> Result<MultipartReader> {
        let boundary = content_type_boundary(content_type).ok_or(Error::BadBoundary)?;
        MultipartReader::parse(source, &boundary).await
    }

    pub async fn parse(source: SharedStream, boundary: &str) -> Result<MultipartReader> {
        let mut parts = Vec::new();
        let mut epilogue_start = None;
        {
            let mut stream = StreamRef::whole(source.clone())
                .open_stream(StreamFlags::READ)
                .await?;
            let bnd = boundary.as_bytes();

            let mut state = ScanState::ScanBoundary;
            let mut offset: u64 = 0;
            let mut line = Vec::new();

            let mut header_start: u64 = 0;
            let mut header_len: u64 = 0;
            let mut in_prologue = true;
            let mut body_start: u64 = 0;
            let mut body_lines: usize = 0;

            while state != ScanState::End {
                line.clear();
                let n = stream.read_line(&mut line).await?;
                if n == 0 {
                    break;
                }
                match state {
                    ScanState::ScanBoundary => match match_boundary(&line, bnd) {
                        BoundaryMatch::No => {
                            body_lines += 1;
                        }
                        m => {
                            if !in_prologue {
                                // The newline before the boundary is part
                                // of the encapsulation, not of the body.
                                let body_len = if offset > body_start {
                                    offset - body_start - 1
                                } else {
                                    0
                                };
                                let lines = body_lines.saturating_sub(1);
                                parts.push(PartLocation {
                                    header_start,
                                    header_len,
                                    body_start,
                                    body_len,
                                    body_lines: lines,
                                });
                            }
                            if m == BoundaryMatch::Close {
                                state = ScanState::End;
                                epilogue_start = Some(offset + n as u64);
                            } else {
                                state = ScanState::Headers;
                                header_start = offset + n as u64;
                                header_len = 0;
                            }
                        }
                    },
                    ScanState::Headers => {
                        if line == b"\n" || line == b"\r\n" {
                            state = ScanState::ScanBoundary;
                            in_prologue = false;
                            body_start = offset + n as u64;
                            body_lines = 0;
                        } else {
                            header_len += n as u64;
                        }
                    }
                    ScanState::End => {}
                }
                offset += n as u64;
            }

            if state != ScanState::End {
                if in_prologue {
                    return Err(Error::Parse(format!(
                        "no boundary \"--{}\" found",
                        boundary
                    )));
                }
                // Unterminated final part: everything to EOF belongs to it.
                parts.push(PartLocation {
                    header_start,
                    header_len,
                    body_start,
                    body_len: offset.saturating_sub(body_start),
                    body_lines,
                });
                tracing::debug!(boundary, "multipart not closed; accepted trailing part");
            }
        }

        Ok(MultipartReader {
            source,
            boundary: boundary.to_string(),
            parts,
            epilogue_start,
        })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn count(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, index: usize) -> Option<&PartLocation> {
        self.parts.get(index)
    }

    pub fn epilogue_start(&self) -> Option<u64> {
        self.epilogue_start
    }

    /// Raw header block of a part, as a bounded stream window.
    pub async fn part_header_stream(&self, index: usize) -> Result<Stream> {
        let part = self.parts.get(index).ok_or_else(|| {
            Error::Parse(format!("no such part: {}", index + 1))
        })?;
        Ok(StreamRef::new(self.source.clone(), part.header_start, Some(part.header_len))
            .open_stream(StreamFlags::READ)
            .await?)
    }

    /// Body of a part, as a bounded stream window. Feed this back into
    /// [`MultipartReader::parse`] for nested multiparts.
    pub async fn part_body_stream(&self, index: usize) -> Result<Stream> {
        let part = self.parts.get(index).ok_or_else(|| {
            Error::Parse(format!("no such part: {}", index + 1))
        })?;
        Ok(StreamRef::new(self.source.clone(), part.body_start, Some(part.body_len))
            .open_stream(StreamFlags::READ)
            .await?)
    }

    /// Shared window over a part body, for callers that hand out
    /// several readers.
    pub fn part_body_ref(&self, index: usize) -> Option<StreamRef> {
        let part = self.parts.get(index)?;
        Some(StreamRef::new(
            self.source.clone(),
            part.body_start,
            Some(part.body_len),
        ))
    }
}
