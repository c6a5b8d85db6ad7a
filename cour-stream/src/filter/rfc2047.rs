use crate::error::{Error, Result};
use crate::filter::{base64, Codec, FilterMode};

/// What to do with an encoded-word in a charset we cannot convert.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FallbackPolicy {
    /// Report an error.
    None,
    /// Copy the decoded octets through unchanged.
    CopyPass,
    /// Copy the decoded octets, rendering high bytes as `\NNN` octal.
    CopyOctal,
    /// Replace each undecodable byte with `?`.
    Replace,
}

/// RFC 2047 encoded-word codec for header values.
///
/// Header values are short, so the codec accumulates its input and does
/// the work in `finish`; this keeps encoded-words intact regardless of
/// how the caller chunks its writes.
pub struct Rfc2047Codec {
    mode: FilterMode,
    charset: String,
    policy: FallbackPolicy,
    hold: Vec<u8>,
}

impl Rfc2047Codec {
    pub fn new(mode: FilterMode, charset: &str, policy: FallbackPolicy) -> Rfc2047Codec {
        Rfc2047Codec {
            mode,
            charset: charset.to_string(),
            policy,
            hold: Vec::new(),
        }
    }

    fn decode_all(&self, out: &mut Vec<u8>) -> Result<()> {
        let input = &self.hold;
        let mut i = 0;
        let mut last_was_word = false;
        let mut pending_space: Vec<u8> = Vec::new();
        while i < input.len() {
            if input[i] == b'=' && input.get(i + 1) == Some(&b'?') {
                if let Some((decoded, end)) = decode_word(&input[i..], self.policy)? {
                    // Whitespace between adjacent encoded-words is elided.
                    if !last_was_word {
                        out.append(&mut pending_space);
                    } else {
                        pending_space.clear();
                    }
                    out.extend_from_slice(&decoded);
                    i += end;
                    last_was_word = true;
                    continue;
                }
            }
            let b = input[i];
            if b == b' ' || b == b'\t' {
                pending_space.push(b);
            } else {
                out.append(&mut pending_space);
                out.push(b);
                last_was_word = false;
            }
            i += 1;
        }
        out.append(&mut pending_space);
        Ok(())
    }

    fn encode_all(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut first = true;
        for word in self.hold.split(|&b| b == b' ') {
            if !first {
                out.push(b' ');
            }
            first = false;
            if word.iter().all(|b| b.is_ascii() && *b != b'=') {
                out.extend_from_slice(word);
            } else {
                out.extend_from_slice(b"=?");
                out.extend_from_slice(self.charset.as_bytes());
                out.extend_from_slice(b"?B?");
                base64::encode_slice(word, out);
                out.extend_from_slice(b"?=");
            }
        }
        Ok(())
    }
}

fn convert(charset: &str, data: &[u8], policy: FallbackPolicy) -> Result<Vec<u8>> {
    let cs = charset.to_ascii_uppercase();
    match cs.as_str() {
        "UTF-8" | "UTF8" | "US-ASCII" | "ASCII" => Ok(data.to_vec()),
        "ISO-8859-1" | "LATIN1" | "LATIN-1" => {
            let mut out = Vec::with_capacity(data.len());
            for &b in data {
                let mut buf = [0u8; 4];
                out.extend_from_slice((b as char).encode_utf8(&mut buf).as_bytes());
            }
            Ok(out)
        }
        _ => match policy {
            FallbackPolicy::None => Err(Error::Codec(format!("unknown charset {}", charset))),
            FallbackPolicy::CopyPass => Ok(data.to_vec()),
            FallbackPolicy::CopyOctal => {
                let mut out = Vec::new();
                for &b in data {
                    if b < 0x80 {
                        out.push(b);
                    } else {
                        out.extend_from_slice(format!("\\{:03o}", b).as_bytes());
                    }
                }
                Ok(out)
            }
            FallbackPolicy::Replace => Ok(data
                .iter()
                .map(|&b| if b < 0x80 { b } else { b'?' })
                .collect()),
        },
    }
}

fn decode_q(text: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut i = 0;
    while i < text.len() {
        match text[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hi = text.get(i + 1).copied().unwrap_or(0);
                let lo = text.get(i + 2).copied().unwrap_or(0);
                let h = (hi as char).to_digit(16);
                let l = (lo as char).to_digit(16);
                match (h, l) {
                    (Some(h), Some(l)) => {
                        out.push(((h << 4) | l) as u8);
                        i += 2;
                    }
                    _ => return Err(Error::Codec("bad Q-encoding escape".into())),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    Ok(())
}

/// Decode one `=?charset?enc?text?=` token starting at the head of
/// `input`. Returns the decoded bytes and the token length, or None if
/// the head is not a well-formed encoded-word.
fn decode_word(input: &[u8], policy: FallbackPolicy) -> Result<Option<(Vec<u8>, usize)>> {
    // input starts with "=?"
    let body = &input[2..];
    let mut parts = body.splitn(3, |&b| b == b'?');
    let charset = match parts.next() {
        Some(c) if !c.is_empty() => c,
        _ => return Ok(None),
    };
    let encoding = match parts.next() {
        Some(e) if e.len() == 1 => e[0],
        _ => return Ok(None),
    };
    let rest = match parts.next() {
        Some(r) => r,
        None => return Ok(None),
    };
    let close = match rest.windows(2).position(|w| w == b"?=") {
        Some(p) => p,
        None => return Ok(None),
    };
    let text = &rest[..close];
    let mut raw = Vec::new();
    match encoding.to_ascii_uppercase() {
        b'B' => base64::decode_slice(text, &mut raw)?,
        b'Q' => decode_q(text, &mut raw)?,
        _ => return Ok(None),
    }
    let charset = String::from_utf8_lossy(charset).into_owned();
    // Strip a possible "*lang" suffix from the charset.
    let charset = charset.split('*').next().unwrap_or("").to_string();
    let converted = convert(&charset, &raw, policy)?;
    let token_len = 2 + (body.len() - rest.len()) + close + 2;
    Ok(Some((converted, token_len)))
}

impl Codec for Rfc2047Codec {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let _ = out;
        self.hold.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let res = match self.mode {
            FilterMode::Decode => self.decode_all(out),
            FilterMode::Encode => self.encode_all(out),
        };
        self.hold.clear();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> Vec<u8> {
        let mut c = Rfc2047Codec::new(FilterMode::Decode, "UTF-8", FallbackPolicy::CopyPass);
        let mut out = Vec::new();
        c.transform(input, &mut out).unwrap();
        c.finish(&mut out).unwrap();
        out
    }

    #[test]
    fn q_encoded_word() {
        assert_eq!(
            decode(b"=?ISO-8859-1?Q?Andr=E9?= Pirard"),
            "André Pirard".as_bytes()
        );
    }

    #[test]
    fn b_encoded_word() {
        assert_eq!(decode(b"=?UTF-8?B?Y2Fmw6k=?="), "café".as_bytes());
    }

    #[test]
    fn space_between_words_is_elided() {
        assert_eq!(
            decode(b"=?UTF-8?Q?one?= =?UTF-8?Q?two?="),
            b"onetwo".as_slice()
        );
    }

    #[test]
    fn plain_text_passes() {
        assert_eq!(decode(b"no words here"), b"no words here".as_slice());
    }

    #[test]
    fn unknown_charset_policy_none_errors() {
        let mut c = Rfc2047Codec::new(FilterMode::Decode, "UTF-8", FallbackPolicy::None);
        let mut out = Vec::new();
        c.transform(b"=?X-KLINGON?Q?Qapla=FF?=", &mut out).unwrap();
        assert!(c.finish(&mut out).is_err());
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let mut enc = Rfc2047Codec::new(FilterMode::Encode, "UTF-8", FallbackPolicy::CopyPass);
        let mut encoded = Vec::new();
        enc.transform("tasse de café noir".as_bytes(), &mut encoded)
            .unwrap();
        enc.finish(&mut encoded).unwrap();
        assert_eq!(decode(&encoded), "tasse de café noir".as_bytes());
    }
}
