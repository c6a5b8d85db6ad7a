/// One header field, keeping its original bytes (name, colon, value and
/// any continuation lines) untouched.
#[derive(Clone, Debug)]
pub struct HeaderField {
    name: String,
    value: String,
    raw: Vec<u8>,
}

impl HeaderField {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unfolded, trimmed value.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// An ordered header block. Field order, whitespace and folding are
/// preserved byte for byte; lookups are case-insensitive and return the
/// first occurrence.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    fields: Vec<HeaderField>,
}

impl Headers {
    /// Parse a raw header block (without the terminating blank line).
    /// Unparsable lines are kept attached to the preceding field so no
    /// byte is ever lost.
    pub fn parse(raw: &[u8]) -> Headers {
        let mut fields: Vec<HeaderField> = Vec::new();
        for line in split_inclusive_newline(raw) {
            let folded = line.first().is_some_and(|b| *b == b' ' || *b == b'\t');
            if folded && !fields.is_empty() {
                let last = fields.last_mut().unwrap();
                last.raw.extend_from_slice(line);
                let tail = String::from_utf8_lossy(line).trim().to_string();
                if !tail.is_empty() {
                    if !last.value.is_empty() {
                        last.value.push(' ');
                    }
                    last.value.push_str(&tail);
                }
                continue;
            }
            match line.iter().position(|&b| b == b':') {
                Some(colon) => {
                    let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
                    let value = String::from_utf8_lossy(&line[colon + 1..])
                        .trim()
                        .to_string();
                    fields.push(HeaderField {
                        name,
                        value,
                        raw: line.to_vec(),
                    });
                }
                None => {
                    // Malformed line: keep the bytes with the previous
                    // field, or as a nameless field at the start.
                    if let Some(last) = fields.last_mut() {
                        last.raw.extend_from_slice(line);
                    } else {
                        fields.push(HeaderField {
                            name: String::new(),
                            value: String::from_utf8_lossy(line).trim().to_string(),
                            raw: line.to_vec(),
                        });
                    }
                }
            }
        }
        Headers { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    /// First value of the named field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.is(name))
            .map(|f| f.value())
    }

    /// Raw bytes of the whole block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for f in &self.fields {
            out.extend_from_slice(&f.raw);
        }
        out
    }

    /// Raw bytes of the block with the named fields removed.
    pub fn to_bytes_excluding(&self, exclude: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in &self.fields {
            if exclude.iter().any(|x| f.is(x)) {
                continue;
            }
            out.extend_from_slice(&f.raw);
        }
        out
    }
}

fn split_inclusive_newline(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split_inclusive(|&b| b == b'\n')
}
