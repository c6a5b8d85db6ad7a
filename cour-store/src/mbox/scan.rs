use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};

use crate::envelope::{Envelope, ENVELOPE_DATE_FORMAT};

/// Parsed mbox envelope line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FromLine {
    pub sender: String,
    /// Normalized to the 24-byte ctime-like form.
    pub date: String,
}

/// Validate and pick apart a `From ` line.
///
/// Handles every flavor in circulation, antiquated ones included:
///
/// ```text
///              From user Wed Dec  2 05:53 1992
/// BSD          From user Wed Dec  2 05:53:22 1992
/// SysV         From user Wed Dec  2 05:53 PST 1992
/// rn           From user Wed Dec  2 05:53:22 PST 1992
///              From user Wed Dec  2 05:53 -0700 1992
///              From user Wed Dec  2 05:53:22 -0700 1992
///              From user Wed Dec  2 05:53 1992 PST
///              From user Wed Dec  2 05:53:22 1992 PST
///              From user Wed Dec  2 05:53 1992 -0700
/// Solaris      From user Wed Dec  2 05:53:22 1992 -0700
/// ```
///
/// plus any of them followed by `" remote from <host>"`. The exact
/// shape is detected by probing fixed offsets backwards from the line
/// end. The sender may contain spaces.
pub fn parse_from_line(line: &[u8]) -> Option<FromLine> {
    if !line.starts_with(b"From ") {
        return None;
    }
    let nl = line
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(line.len());
    let at = |i: i64| -> u8 {
        if i >= 0 && (i as usize) < line.len() {
            line[i as usize]
        } else {
            0
        }
    };

    let mut x = nl as i64;
    if x >= 41 {
        const SUF: &[u8] = b" remote from ";
        let mut zn: i64 = -1;
        while x + zn > 0 && at(x + zn) != b' ' {
            zn -= 1;
        }
        let start = x + zn - SUF.len() as i64 + 1;
        if start >= 0 && line[start as usize..].starts_with(SUF) {
            x = start;
        }
    }

    let mut ti: i64 = 0;
    let mut zn: i64 = 0;
    if x >= 27 {
        if at(x - 5) == b' ' {
            if at(x - 8) == b':' {
                zn = 0;
                ti = -5;
            } else if at(x - 9) == b' ' {
                ti = -9;
                zn = -9;
            } else if at(x - 11) == b' ' && (at(x - 10) == b'+' || at(x - 10) == b'-') {
                ti = -11;
                zn = -11;
            }
        } else if at(x - 4) == b' ' {
            if at(x - 9) == b' ' {
                zn = -4;
                ti = -9;
            }
        } else if at(x - 6) == b' '
            && at(x - 11) == b' '
            && (at(x - 5) == b'+' || at(x - 5) == b'-')
        {
            zn = -6;
            ti = -11;
        }
        if ti != 0 {
            if at(x + ti - 3) == b':' {
                ti -= if at(x + ti - 6) == b':' { 9 } else { 6 };
                if !(at(x + ti) == b' '
                    && at(x + ti - 3) == b' '
                    && at(x + ti - 7) == b' '
                    && at(x + ti - 11) == b' ')
                {
                    ti = 0;
                }
            } else {
                ti = 0;
            }
        }
    }
    if ti == 0 {
        return None;
    }

    let time_sp = (x + ti) as usize; // the space before HH:MM
    let date_start = time_sp - 10; // "Www Mmm dd" before it
    let sender = String::from_utf8_lossy(&line[5..date_start])
        .trim_end_matches(' ')
        .to_string();

    let date = if zn == 0 {
        normalize_plain(line, date_start, time_sp)
    } else {
        normalize_zoned(&line[date_start..x as usize])
    };

    Some(FromLine { sender, date })
}

/// No zone: the timestamp is already in ctime order, possibly lacking
/// seconds (assumed `:00`).
fn normalize_plain(line: &[u8], date_start: usize, time_sp: usize) -> String {
    let has_seconds = line.get(time_sp + 6) == Some(&b':');
    if has_seconds {
        String::from_utf8_lossy(&line[date_start..date_start + 24]).into_owned()
    } else {
        let head = String::from_utf8_lossy(&line[date_start..date_start + 16]);
        let year = String::from_utf8_lossy(&line[time_sp + 7..time_sp + 11]);
        format!("{}:00 {}", head, year)
    }
}

/// Zone present, before or after the year. Parse the pieces, convert a
/// numeric offset to UTC, and reformat in ctime order. Named zones are
/// taken at face value (no offset applied); an unparsable stamp falls
/// back to the current time.
fn normalize_zoned(stamp: &[u8]) -> String {
    let text = String::from_utf8_lossy(stamp);
    match parse_zoned(&text) {
        Some(date) => date,
        None => Envelope::now_date(),
    }
}

fn parse_zoned(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() < 5 {
        return None;
    }
    let month = match tokens[1] {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let day: u32 = tokens[2].parse().ok()?;
    let mut time = tokens[3].split(':');
    let hour: u32 = time.next()?.parse().ok()?;
    let minute: u32 = time.next()?.parse().ok()?;
    let second: u32 = time.next().unwrap_or("0").parse().ok()?;

    let mut year: Option<i32> = None;
    let mut offset_minutes: Option<i32> = None;
    for tok in &tokens[4..] {
        if tok.len() == 4 && tok.bytes().all(|b| b.is_ascii_digit()) {
            year = tok.parse().ok();
        } else if (tok.starts_with('+') || tok.starts_with('-')) && tok.len() == 5 {
            let hours: i32 = tok[1..3].parse().ok()?;
            let mins: i32 = tok[3..5].parse().ok()?;
            let sign = if tok.starts_with('-') { -1 } else { 1 };
            offset_minutes = Some(sign * (hours * 60 + mins));
        }
        // Anything else is a named zone; accepted, no offset applied.
    }
    let year = year?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    let utc = match offset_minutes {
        Some(mins) => {
            let offset = FixedOffset::east_opt(mins * 60)?;
            offset
                .from_local_datetime(&naive)
                .single()?
                .with_timezone(&Utc)
        }
        None => Utc.from_utc_datetime(&naive),
    };
    Some(utc.format(ENVELOPE_DATE_FORMAT).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bsd_form() {
        let f = parse_from_line(b"From joe Wed Dec  2 05:53:22 1992\n").unwrap();
        assert_eq!(f.sender, "joe");
        assert_eq!(f.date, "Wed Dec  2 05:53:22 1992");
    }

    #[test]
    fn no_seconds_form() {
        let f = parse_from_line(b"From joe Wed Dec  2 05:53 1992\n").unwrap();
        assert_eq!(f.date, "Wed Dec  2 05:53:00 1992");
    }

    #[test]
    fn named_zone_before_year() {
        let f = parse_from_line(b"From joe Wed Dec  2 05:53:22 GMT 1992\n").unwrap();
        assert_eq!(f.date, "Wed Dec  2 05:53:22 1992");
    }

    #[test]
    fn numeric_zone_is_converted_to_utc() {
        let f = parse_from_line(b"From joe Wed Dec  2 05:53:22 -0700 1992\n").unwrap();
        assert_eq!(f.date, "Wed Dec  2 12:53:22 1992");
    }

    #[test]
    fn zone_after_year() {
        let f = parse_from_line(b"From joe Wed Dec  2 05:53:22 1992 PST\n").unwrap();
        assert_eq!(f.date, "Wed Dec  2 05:53:22 1992");
    }

    #[test]
    fn remote_from_suffix() {
        let f =
            parse_from_line(b"From joe Wed Dec  2 05:53:22 1992 remote from relay.example\n")
                .unwrap();
        assert_eq!(f.sender, "joe");
        assert_eq!(f.date, "Wed Dec  2 05:53:22 1992");
    }

    #[test]
    fn sender_with_spaces() {
        let f = parse_from_line(b"From Joe R. User Wed Dec  2 05:53:22 1992\n").unwrap();
        assert_eq!(f.sender, "Joe R. User");
    }

    #[test]
    fn invalid_lines_are_rejected() {
        assert!(parse_from_line(b"From the start of the body\n").is_none());
        assert!(parse_from_line(b"Subject: From nothing\n").is_none());
        assert!(parse_from_line(b"From joe\n").is_none());
    }
}
