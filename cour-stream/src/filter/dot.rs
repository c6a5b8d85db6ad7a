use crate::error::Result;
use crate::filter::Codec;

/// SMTP dot-stuffing: a line beginning with `.` gets one more `.`.
pub struct DotEncode {
    line_start: bool,
}

impl DotEncode {
    pub fn new() -> DotEncode {
        DotEncode { line_start: true }
    }
}

impl Codec for DotEncode {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in input {
            if self.line_start && b == b'.' {
                out.push(b'.');
            }
            out.push(b);
            self.line_start = b == b'\n';
        }
        Ok(())
    }
}

#[derive(PartialEq)]
enum DecodeState {
    LineStart,
    AfterDot,
    Line,
    Done,
}

/// Reverses dot-stuffing and terminates the stream at a line holding a
/// single `.`.
pub struct DotDecode {
    state: DecodeState,
}

impl DotDecode {
    pub fn new() -> DotDecode {
        DotDecode {
            state: DecodeState::LineStart,
        }
    }
}

impl Codec for DotDecode {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in input {
            match self.state {
                DecodeState::LineStart => {
                    if b == b'.' {
                        // Swallow the stuffing dot; decide on next byte.
                        self.state = DecodeState::AfterDot;
                    } else {
                        out.push(b);
                        if b != b'\n' {
                            self.state = DecodeState::Line;
                        }
                    }
                }
                DecodeState::AfterDot => {
                    if b == b'\n' {
                        self.state = DecodeState::Done;
                        return Ok(());
                    }
                    out.push(b);
                    self.state = DecodeState::Line;
                }
                DecodeState::Line => {
                    out.push(b);
                    if b == b'\n' {
                        self.state = DecodeState::LineStart;
                    }
                }
                DecodeState::Done => return Ok(()),
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        // A trailing lone dot without newline still terminates; a held
        // dot followed by nothing was a stuffed empty line.
        if self.state == DecodeState::AfterDot {
            out.push(b'.');
            self.state = DecodeState::Done;
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.state == DecodeState::Done
    }
}
