use crate::error::Result;
use crate::filter::Codec;

/// LF to CRLF.
pub struct CrlfEncode;

impl CrlfEncode {
    pub fn new() -> CrlfEncode {
        CrlfEncode
    }
}

impl Default for CrlfEncode {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for CrlfEncode {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in input {
            if b == b'\n' {
                out.push(b'\r');
            }
            out.push(b);
        }
        Ok(())
    }
}

/// CRLF to LF. A CR is removed only when followed by LF; bare CRs pass.
pub struct CrlfDecode {
    pending_cr: bool,
}

impl CrlfDecode {
    pub fn new() -> CrlfDecode {
        CrlfDecode { pending_cr: false }
    }
}

impl Default for CrlfDecode {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for CrlfDecode {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in input {
            if self.pending_cr {
                self.pending_cr = false;
                if b != b'\n' {
                    out.push(b'\r');
                }
            }
            if b == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.pending_cr {
            out.push(b'\r');
            self.pending_cr = false;
        }
        Ok(())
    }
}
