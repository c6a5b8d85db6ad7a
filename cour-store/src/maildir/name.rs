use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::attribute::Attributes;

/// Standard info letters, in the fixed order they are emitted.
///
/// `S` marks a message the user has viewed, which corresponds to the
/// READ attribute; SEEN (and FLAGGED, redundantly) travel in the
/// mailutils-specific `a=` attribute instead.
const INFO_MAP: &[(u8, Attributes)] = &[
    (b'D', Attributes::DRAFT),
    (b'F', Attributes::FLAGGED),
    (b'P', Attributes::FORWARDED),
    (b'R', Attributes::ANSWERED),
    (b'S', Attributes::READ),
    (b'T', Attributes::DELETED),
];

/// Letters written by mailutils versions up to 3.10; accepted on load
/// when the property file says the store is that old.
const LEGACY_INFO_MAP: &[(u8, Attributes)] = &[
    (b'D', Attributes::DRAFT),
    (b'F', Attributes::FLAGGED),
    (b'P', Attributes::FORWARDED),
    (b'R', Attributes::READ),
    (b'S', Attributes::SEEN),
    (b'T', Attributes::DELETED),
    (b'a', Attributes::ANSWERED),
];

pub(crate) fn info_to_flags(info: &str, legacy: bool) -> Attributes {
    let map = if legacy { LEGACY_INFO_MAP } else { INFO_MAP };
    let mut attrs = Attributes::empty();
    for b in info.bytes() {
        for &(letter, flag) in map {
            if b == letter {
                attrs.insert(flag);
                break;
            }
        }
        // The legacy answered marker is always accepted on read; the
        // standard letter is what gets written back.
        if !legacy && b == b'a' {
            attrs.insert(Attributes::ANSWERED);
        }
    }
    attrs
}

pub(crate) fn flags_to_info(attrs: Attributes) -> String {
    let mut out = String::new();
    for &(letter, flag) in INFO_MAP {
        if attrs.contains(flag) {
            out.push(letter as char);
        }
    }
    out
}

/// What a message file name tells us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParsedName {
    /// Length of the unique prefix, up to the first attribute comma or
    /// the info colon.
    pub uniq_len: usize,
    pub flags: Attributes,
    pub uid: Option<u32>,
}

/// Take a maildir file name apart:
/// `<unique>[,<name>=<value>,...][:2,<flags>]`.
///
/// The unique part contains no colon; comma-separated `name=value`
/// attributes ride inside it. Recognized attributes are `u` (the UID)
/// and `a` (attribute letters with no standard info letter). Anything
/// unparsable degrades to "no flags, no uid" rather than an error.
pub(crate) fn parse_name(name: &str, legacy: bool) -> ParsedName {
    let (left, info) = match name.split_once(':') {
        Some((l, r)) => match r.strip_prefix("2,") {
            Some(flags) => (l, Some(flags)),
            None => (l, None),
        },
        None => (name, None),
    };

    let mut flags = match info {
        Some(letters) => info_to_flags(letters, legacy),
        None => Attributes::empty(),
    };

    // Strip `,name=value` attributes off the tail of the unique part.
    let mut uniq_end = left.len();
    let mut uid = None;
    loop {
        let head = &left[..uniq_end];
        let comma = match head.rfind(',') {
            Some(c) => c,
            None => break,
        };
        let attr = &head[comma + 1..];
        let Some((key, value)) = attr.split_once('=') else {
            break;
        };
        if key.is_empty() || key.contains(',') || value.contains(',') {
            break;
        }
        match key {
            "u" => {
                if uid.is_none() {
                    uid = value.parse().ok();
                }
            }
            "a" => flags.merge_status_letters(value),
            _ => {} // unknown attributes are tolerated
        }
        uniq_end = comma;
    }

    ParsedName {
        uniq_len: uniq_end,
        flags,
        uid,
    }
}

/// Compose a cur/ file name from the unique prefix, flags and UID.
pub(crate) fn format_name(uniq: &str, attrs: Attributes, uid: u32) -> String {
    let mut out = String::from(uniq);
    let mu_letters = attrs
        .intersection(Attributes::FLAGGED | Attributes::SEEN)
        .to_status_letters();
    if !mu_letters.is_empty() {
        out.push_str(",a=");
        out.push_str(&mu_letters);
    }
    out.push_str(",u=");
    out.push_str(&uid.to_string());
    out.push_str(":2,");
    out.push_str(&flags_to_info(attrs));
    out
}

/// Hostname with `/`, `:` and `,` escaped as `\NNN` octal triplets.
fn encoded_hostname() -> String {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let mut out = String::new();
    for c in host.chars() {
        match c {
            '/' | ':' | ',' => out.push_str(&format!("\\{:03o}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

/// Generate the unique prefix for a new delivery:
/// `<sec>.R<rand>I<ino>V<dev>M<usec>P<pid>Q<seq>.<host>`, hex fields
/// uppercase, decimal elsewhere.
pub(crate) fn generate_unique(dir: &Path, seq: usize) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let (ino, dev) = std::fs::metadata(dir)
        .map(|m| {
            use std::os::unix::fs::MetadataExt;
            (m.ino(), m.dev())
        })
        .unwrap_or((0, 0));
    format!(
        "{}.R{:X}I{:X}V{:X}M{}P{}Q{}.{}",
        now.as_secs(),
        rand::thread_rng().gen::<u32>(),
        ino,
        dev,
        now.subsec_micros(),
        std::process::id(),
        seq,
        encoded_hostname()
    )
}

/// Delivery order: seconds, then the `M` and `Q` counters, then plain
/// lexicographic comparison up to the info colon.
pub(crate) fn delivery_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn leading_num(s: &str) -> (u64, &str) {
        let end = s.bytes().take_while(|b| b.is_ascii_digit()).count();
        (s[..end].parse().unwrap_or(0), &s[end..])
    }
    fn num_after<'a>(s: &'a str, marker: char) -> (u64, &'a str) {
        match s.find(marker) {
            Some(i) => leading_num(&s[i + 1..]),
            None => (0, s),
        }
    }

    let (sa, ra) = leading_num(a);
    let (sb, rb) = leading_num(b);
    match sa.cmp(&sb) {
        Ordering::Equal => {}
        other => return other,
    }

    let (ma, ra) = num_after(ra, 'M');
    let (mb, rb) = num_after(rb, 'M');
    match ma.cmp(&mb) {
        Ordering::Equal => {}
        other => return other,
    }

    let (qa, ra) = num_after(ra, 'Q');
    let (qb, rb) = num_after(rb, 'Q');
    match qa.cmp(&qb) {
        Ordering::Equal => {}
        other => return other,
    }

    let ta = ra.split(':').next().unwrap_or(ra);
    let tb = rb.split(':').next().unwrap_or(rb);
    ta.cmp(tb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_unique_name() {
        let p = parse_name("1600000000.R1A2BI3V4M500P600Q1.host", false);
        assert_eq!(p.uniq_len, "1600000000.R1A2BI3V4M500P600Q1.host".len());
        assert_eq!(p.flags, Attributes::empty());
        assert_eq!(p.uid, None);
    }

    #[test]
    fn name_with_uid_and_info() {
        let p = parse_name("1600000000.R1I2V3M4P5Q6.host,u=42:2,RS", false);
        assert_eq!(p.uniq_len, "1600000000.R1I2V3M4P5Q6.host".len());
        assert_eq!(p.uid, Some(42));
        assert_eq!(p.flags, Attributes::ANSWERED | Attributes::READ);
    }

    #[test]
    fn mu_attribute_letters() {
        let p = parse_name("uniq,a=FO,u=7:2,S", false);
        assert_eq!(p.uniq_len, 4);
        assert_eq!(p.uid, Some(7));
        assert_eq!(
            p.flags,
            Attributes::FLAGGED | Attributes::SEEN | Attributes::READ
        );
    }

    #[test]
    fn legacy_letters_are_remapped() {
        // Modern reading: R = answered, S = read.
        let modern = parse_name("uniq:2,RSa", false);
        assert_eq!(modern.flags, Attributes::ANSWERED | Attributes::READ);
        // Legacy reading: R = read, S = seen, a = answered.
        let legacy = parse_name("uniq:2,RSa", true);
        assert_eq!(
            legacy.flags,
            Attributes::READ | Attributes::SEEN | Attributes::ANSWERED
        );
    }

    #[test]
    fn format_writes_standard_letters() {
        let name = format_name(
            "uniq",
            Attributes::ANSWERED | Attributes::READ,
            5,
        );
        assert_eq!(name, "uniq,u=5:2,RS");
        let name = format_name("uniq", Attributes::SEEN | Attributes::READ, 5);
        assert_eq!(name, "uniq,a=O,u=5:2,S");
    }

    #[test]
    fn formatted_names_parse_back() {
        let attrs = Attributes::FLAGGED | Attributes::SEEN | Attributes::DELETED;
        let name = format_name("1600000000.R1I2V3M4P5Q6.host", attrs, 19);
        let p = parse_name(&name, false);
        assert_eq!(p.flags, attrs);
        assert_eq!(p.uid, Some(19));
        assert_eq!(p.uniq_len, "1600000000.R1I2V3M4P5Q6.host".len());
    }

    #[test]
    fn unique_names_match_the_grammar(){
        let dir = std::env::temp_dir();
        let name = generate_unique(&dir, 3);
        let dot = name.find('.').unwrap();
        assert!(name[..dot].bytes().all(|b| b.is_ascii_digit()));
        let rest = &name[dot + 1..];
        assert!(rest.starts_with('R'));
        for marker in ['I', 'V', 'M', 'P', 'Q'] {
            assert!(rest.contains(marker));
        }
        assert!(rest.contains('.'));
        assert!(!name.contains(':'));
        assert!(!name.contains('/'));
    }

    #[test]
    fn delivery_order() {
        use std::cmp::Ordering;
        assert_eq!(
            delivery_cmp("100.M5P1Q1.h", "101.M1P1Q1.h"),
            Ordering::Less
        );
        assert_eq!(
            delivery_cmp("100.M5P1Q1.h", "100.M7P1Q1.h"),
            Ordering::Less
        );
        assert_eq!(
            delivery_cmp("100.M5P1Q2.h", "100.M5P1Q1.h"),
            Ordering::Greater
        );
        assert_eq!(
            delivery_cmp("100.M5P1Q1.h:2,S", "100.M5P1Q1.h:2,RS"),
            Ordering::Equal
        );
    }
}
