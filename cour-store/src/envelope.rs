use chrono::{TimeZone, Utc};

use crate::header::Headers;

/// ctime-like form used on mbox From_ lines, 24 bytes:
/// `Www Mmm _d HH:MM:SS YYYY`.
pub const ENVELOPE_DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

pub const MAILER_DAEMON: &str = "MAILER-DAEMON";

/// The mbox envelope: sender address and delivery date, distinct from
/// the message headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub date: String,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, date: impl Into<String>) -> Envelope {
        Envelope {
            sender: sender.into(),
            date: date.into(),
        }
    }

    /// Current UTC time in envelope form.
    pub fn now_date() -> String {
        Utc::now().format(ENVELOPE_DATE_FORMAT).to_string()
    }

    /// Reconstruct an envelope for a message that carries none: sender
    /// from `From:`, then `Sender:`; date from the first `Received:`
    /// stamp. Whatever is still missing is synthesized.
    pub fn reconstruct(headers: &Headers) -> Envelope {
        let sender = headers
            .get("From")
            .or_else(|| headers.get("Sender"))
            .map(extract_address)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| MAILER_DAEMON.to_string());

        let date = headers
            .get("Received")
            .and_then(received_date)
            .unwrap_or_else(Envelope::now_date);

        Envelope { sender, date }
    }
}

/// Pull a bare address out of a `From:`-style value: the angle-bracket
/// form wins, otherwise the first word that is not a comment.
pub fn extract_address(value: &str) -> String {
    if let (Some(open), Some(close)) = (value.find('<'), value.rfind('>')) {
        if open < close {
            return value[open + 1..close].trim().to_string();
        }
    }
    value
        .split_whitespace()
        .find(|w| !w.starts_with('('))
        .unwrap_or("")
        .trim_matches(|c| c == '"' || c == ',')
        .to_string()
}

/// Date from a `Received:` value: the part after the final `;`,
/// normalized to envelope form when parsable.
fn received_date(value: &str) -> Option<String> {
    let stamp = value.rsplit(';').next()?.trim();
    if stamp.is_empty() {
        return None;
    }
    match chrono::DateTime::parse_from_rfc2822(stamp) {
        Ok(dt) => Some(dt.with_timezone(&Utc).format(ENVELOPE_DATE_FORMAT).to_string()),
        Err(_) => None,
    }
}

/// Format an epoch second in envelope form.
pub fn format_epoch(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => dt.format(ENVELOPE_DATE_FORMAT).to_string(),
        _ => Envelope::now_date(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstruct_uses_from_header() {
        let h = Headers::parse(b"From: Joe User <joe@example.org>\nSubject: x\n");
        let env = Envelope::reconstruct(&h);
        assert_eq!(env.sender, "joe@example.org");
    }

    #[test]
    fn reconstruct_falls_back_to_mailer_daemon() {
        let h = Headers::parse(b"Subject: x\n");
        let env = Envelope::reconstruct(&h);
        assert_eq!(env.sender, MAILER_DAEMON);
        assert_eq!(env.date.len(), 24);
    }

    #[test]
    fn received_stamp_is_normalized() {
        let h = Headers::parse(
            b"Received: from mta by mx (agent); Wed, 2 Dec 1992 05:53:22 +0000\n",
        );
        let env = Envelope::reconstruct(&h);
        assert_eq!(env.date, "Wed Dec  2 05:53:22 1992");
    }

    #[test]
    fn bare_address_forms() {
        assert_eq!(extract_address("joe@x.org"), "joe@x.org");
        assert_eq!(extract_address("Joe <joe@x.org>"), "joe@x.org");
        assert_eq!(extract_address("(comment) joe@x.org"), "joe@x.org");
    }

    #[test]
    fn epoch_formatting() {
        assert_eq!(format_epoch(723275602), "Wed Dec  2 05:53:22 1992");
    }
}
