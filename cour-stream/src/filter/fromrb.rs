use crate::error::Result;
use crate::filter::Codec;

/// True for lines of the shape `>*From `.
fn is_quoted_from(line: &[u8]) -> bool {
    let mut rest = line;
    while let [b'>', tail @ ..] = rest {
        rest = tail;
    }
    rest.starts_with(b"From ")
}

/// mbox From_ escaping: each body line matching `^>*From ` is prefixed
/// with one more `>`. Lines are held back until complete so the pattern
/// can be decided.
pub struct FromrbEncode {
    line: Vec<u8>,
}

impl FromrbEncode {
    pub fn new() -> FromrbEncode {
        FromrbEncode { line: Vec::new() }
    }

    fn emit(&mut self, out: &mut Vec<u8>) {
        if is_quoted_from(&self.line) {
            out.push(b'>');
        }
        out.extend_from_slice(&self.line);
        self.line.clear();
    }
}

impl Codec for FromrbEncode {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in input {
            self.line.push(b);
            if b == b'\n' {
                self.emit(out);
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if !self.line.is_empty() {
            self.emit(out);
        }
        Ok(())
    }
}

/// Reverses [`FromrbEncode`]: one `>` is stripped from `^>+From ` lines.
pub struct FromrbDecode {
    line: Vec<u8>,
}

impl FromrbDecode {
    pub fn new() -> FromrbDecode {
        FromrbDecode { line: Vec::new() }
    }

    fn emit(&mut self, out: &mut Vec<u8>) {
        if self.line.first() == Some(&b'>') && is_quoted_from(&self.line[1..]) {
            out.extend_from_slice(&self.line[1..]);
        } else {
            out.extend_from_slice(&self.line);
        }
        self.line.clear();
    }
}

impl Codec for FromrbDecode {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in input {
            self.line.push(b);
            if b == b'\n' {
                self.emit(out);
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if !self.line.is_empty() {
            self.emit(out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_match() {
        assert!(is_quoted_from(b"From here\n"));
        assert!(is_quoted_from(b">>From here\n"));
        assert!(!is_quoted_from(b" From here\n"));
        assert!(!is_quoted_from(b"Fromage\n"));
        assert!(!is_quoted_from(b">>Fro\n"));
    }

    #[test]
    fn stuffed_line_is_never_a_from_line() {
        let mut enc = FromrbEncode::new();
        let mut out = Vec::new();
        enc.transform(b"From a b c\n", &mut out).unwrap();
        assert!(!out.starts_with(b"From "));
    }
}
