//! The UID bookkeeping headers shared by the file-backed engines.

pub const HDR_STATUS: &str = "Status";
pub const HDR_X_IMAPBASE: &str = "X-IMAPbase";
pub const HDR_X_UID: &str = "X-UID";

/// Headers the engines own and re-synthesize; stripped from incoming
/// messages and from rewritten ones.
pub const UID_HEADERS: [&str; 2] = [HDR_X_IMAPBASE, HDR_X_UID];
pub const ENGINE_HEADERS: [&str; 3] = [HDR_STATUS, HDR_X_IMAPBASE, HDR_X_UID];

/// Decimal width of the widest uidvalidity/uidnext value. Both fields
/// are left-padded to this width so later flushes can usually patch the
/// header in place instead of rewriting the mailbox.
pub const UID_FIELD_WIDTH: usize = 10; // u32::MAX is 4294967295

/// `<uidvalidity> <uidnext>`, both fields padded.
pub fn format_imapbase_value(uidvalidity: u32, uidnext: u32) -> String {
    format!(
        "{:>width$} {:>width$}",
        uidvalidity,
        uidnext,
        width = UID_FIELD_WIDTH
    )
}

/// The full header line, without the trailing newline.
pub fn format_imapbase_header(uidvalidity: u32, uidnext: u32) -> String {
    format!(
        "{}: {}",
        HDR_X_IMAPBASE,
        format_imapbase_value(uidvalidity, uidnext)
    )
}

/// Parse `<uidvalidity> <uidnext>` out of an X-IMAPbase value.
pub fn parse_imapbase_value(value: &str) -> Option<(u32, u32)> {
    let mut it = value.split_whitespace();
    let v = it.next()?.parse().ok()?;
    let n = it.next()?.parse().ok()?;
    Some((v, n))
}

/// If `line` is a `Name: value` header line for `name`
/// (case-insensitive), return the trimmed value.
pub fn header_value<'a>(line: &'a [u8], name: &str) -> Option<&'a str> {
    let n = name.len();
    if line.len() > n && line[..n].eq_ignore_ascii_case(name.as_bytes()) && line[n] == b':' {
        std::str::from_utf8(&line[n + 1..]).ok().map(|v| v.trim())
    } else {
        None
    }
}

/// Epoch seconds, used as a fresh uidvalidity.
pub fn uidvalidity_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imapbase_round_trip() {
        let header = format_imapbase_header(1234, 57);
        assert_eq!(header, "X-IMAPbase:       1234         57");
        let (v, n) = parse_imapbase_value(header.split_once(':').unwrap().1).unwrap();
        assert_eq!((v, n), (1234, 57));
    }

    #[test]
    fn width_covers_u32() {
        assert_eq!(u32::MAX.to_string().len(), UID_FIELD_WIDTH);
    }
}
