//! HP NonStop (Tandem) Guardian listings.
//!
//! ```text
//! File         Code             EOF  Last Modification    Owner  RWEP
//! ALIASES       101            4034  29-Jan-10 12:05:58  255,255 "nnnn"
//! EMSACSTM      101O          17400  19-Sep-07 10:36:14  255,255 "NUNU"
//! ```
//!
//! Guardian subvolumes hold only files.

use crate::ftp::listing::dates::{datetime, expand_year, month_from_abbrev, parse_clock};
use crate::ftp::listing::format::{content_lines, LineOutcome, ParseContext};
use crate::ftp::types::{EntryKind, EntryPermissions, ListEntry};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HEADER: Regex = Regex::new(r"^File\s+Code\s+EOF").unwrap();
    static ref LINE: Regex = Regex::new(
        r#"^(?P<name>\S+)\s+(?P<code>\d+\w*)\s+(?P<eof>\d+)\s+(?P<day>\d{1,2})-(?P<mon>[A-Za-z]{3})-(?P<year>\d{2,4})\s+(?P<time>\d{1,2}:\d{2}:\d{2})\s+(?P<owner>\d+),\s*(?P<group>\d+)\s+"(?P<perms>[^"]*)""#
    )
    .unwrap();
}

pub fn looks_like(sample: &[&str]) -> bool {
    content_lines(sample).next().map_or(false, |l| HEADER.is_match(l))
}

pub fn parse_line(line: &str, _ctx: &ParseContext<'_>) -> LineOutcome {
    if line.trim().is_empty() || HEADER.is_match(line) {
        return LineOutcome::Skip;
    }
    let Some(caps) = LINE.captures(line) else {
        return LineOutcome::Invalid;
    };
    let Some(month) = month_from_abbrev(&caps["mon"]) else {
        return LineOutcome::Invalid;
    };
    let Some((h, m, s)) = parse_clock(&caps["time"]) else {
        return LineOutcome::Invalid;
    };
    let (Ok(day), Ok(year)) = (caps["day"].parse::<u32>(), caps["year"].parse::<i32>()) else {
        return LineOutcome::Invalid;
    };

    let mut entry = ListEntry::new(&caps["name"], EntryKind::File, line);
    entry.size = caps["eof"].parse().unwrap_or(ListEntry::UNKNOWN_SIZE);
    entry.modified = datetime(expand_year(year), month, day, h, m, s);
    entry.owner = Some(caps["owner"].to_string());
    entry.group = Some(caps["group"].to_string());
    entry.permissions = Some(EntryPermissions {
        raw: caps["perms"].to_string(),
        mode: None,
    });
    entry.facts.insert("nonstop.code".to_string(), caps["code"].to_string());
    LineOutcome::Entry(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::listing::format::DialectState;
    use chrono::Utc;

    fn parse(line: &str) -> LineOutcome {
        let d = DialectState::default();
        let ctx = ParseContext {
            directory: "$DATA.SUBVOL",
            dialect: &d,
            vms_strip_version: true,
            now: Utc::now(),
        };
        parse_line(line, &ctx)
    }

    #[test]
    fn file_lines() {
        let LineOutcome::Entry(e) = parse(r#"ALIASES       101            4034  29-Jan-10 12:05:58  255,255 "nnnn""#) else {
            panic!("not parsed");
        };
        assert_eq!(e.name, "ALIASES");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 4034);
        assert_eq!(e.modified, datetime(2010, 1, 29, 12, 5, 58));
        assert_eq!(e.owner.as_deref(), Some("255"));
        assert_eq!(e.permissions.unwrap().raw, "nnnn");

        let LineOutcome::Entry(o) = parse(r#"EMSACSTM      101O          17400  19-Sep-07 10:36:14  255, 255 "NUNU""#) else {
            panic!("not parsed");
        };
        assert_eq!(o.facts.get("nonstop.code").map(String::as_str), Some("101O"));
    }

    #[test]
    fn header_and_detection() {
        let header = "File         Code             EOF  Last Modification    Owner  RWEP";
        assert_eq!(parse(header), LineOutcome::Skip);
        assert!(looks_like(&[header]));
        assert!(!looks_like(&["03-07-13 10:02AM 901 File01.xml"]));
        assert_eq!(parse("03-07-13 10:02AM 901 File01.xml"), LineOutcome::Invalid);
    }
}
