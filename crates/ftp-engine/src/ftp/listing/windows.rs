//! IIS / DOS style listings.
//!
//! ```text
//! 03-07-13  10:02AM                  901 File01.xml
//! 03-07-13  10:03AM       <DIR>          Documents
//! 2013-03-07  22:15       <JUNCTION>     Link [\\server\share]
//! ```

use crate::ftp::listing::dates::{datetime, expand_year, parse_clock};
use crate::ftp::listing::format::{content_lines, LineOutcome, ParseContext};
use crate::ftp::types::{EntryKind, ListEntry};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref LINE: Regex = Regex::new(
        r"^(?P<date>\d{1,4}[-/.]\d{1,2}[-/.]\d{1,4})\s+(?P<time>\d{1,2}:\d{2}(?::\d{2})?\s*(?:[AaPp][Mm])?)\s+(?P<size><DIR>|<JUNCTION>|<SYMLINKD?>|[\d,]+)\s+(?P<name>.+)$"
    )
    .unwrap();
    static ref DATE: Regex = Regex::new(r"^(\d{1,4})[-/.](\d{1,2})[-/.](\d{1,4})$").unwrap();
}

pub fn looks_like(sample: &[&str]) -> bool {
    content_lines(sample)
        .next()
        .map(|l| LINE.is_match(l))
        .unwrap_or(false)
}

/// `MM-dd-yy` as IIS prints by default, `yyyy-MM-dd`, or `dd-MM-yyyy`
/// when the first field cannot be a month.
fn parse_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let caps = DATE.captures(date)?;
    let (a, b, c) = (&caps[1], &caps[2], &caps[3]);
    let (year, month, day) = if a.len() == 4 {
        (a.parse().ok()?, b.parse().ok()?, c.parse().ok()?)
    } else {
        let (first, second): (u32, u32) = (a.parse().ok()?, b.parse().ok()?);
        let year = expand_year(c.parse().ok()?);
        if first > 12 && second <= 12 {
            (year, second, first)
        } else {
            (year, first, second)
        }
    };
    let (h, m, s) = parse_clock(time)?;
    datetime(year, month, day, h, m, s)
}

pub fn parse_line(line: &str, _ctx: &ParseContext<'_>) -> LineOutcome {
    if line.trim().is_empty() {
        return LineOutcome::Skip;
    }
    let Some(caps) = LINE.captures(line) else {
        return LineOutcome::Invalid;
    };
    let Some(modified) = parse_date(&caps["date"], &caps["time"]) else {
        return LineOutcome::Invalid;
    };

    let size_field = &caps["size"];
    let raw_name = caps["name"].trim_end();
    let mut entry = match size_field {
        "<DIR>" => ListEntry::new(raw_name, EntryKind::Directory, line),
        "<JUNCTION>" | "<SYMLINK>" | "<SYMLINKD>" => {
            // Target, when shown, is appended in brackets.
            match raw_name.rsplit_once(" [") {
                Some((n, t)) if t.ends_with(']') => {
                    let mut e = ListEntry::new(n, EntryKind::Link, line);
                    e.link_target = Some(t.trim_end_matches(']').to_string());
                    e
                }
                _ => ListEntry::new(raw_name, EntryKind::Link, line),
            }
        }
        digits => {
            let mut e = ListEntry::new(raw_name, EntryKind::File, line);
            e.size = digits
                .replace(',', "")
                .parse()
                .unwrap_or(ListEntry::UNKNOWN_SIZE);
            e
        }
    };
    entry.modified = Some(modified);
    LineOutcome::Entry(entry)
}
