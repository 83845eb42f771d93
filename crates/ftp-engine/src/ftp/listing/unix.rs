//! `ls -l` style listings.
//!
//! ```text
//! drwxr-xr-x   7 user1 user1   512 Sep 27  2011 .
//! -rw-r--r--   1 ftp   ftp    4096 Mar  2 14:20 notes.txt
//! lrwxrwxrwx   1 root  root      7 Jan  1  2020 bin -> usr/bin
//! ```
//!
//! Link count, owner and group are optional; some servers omit one or
//! more of them.

use crate::ftp::listing::dates::{datetime, month_from_abbrev, parse_clock, recent_date};
use crate::ftp::listing::format::{content_lines, tokens, LineOutcome, ParseContext};
use crate::ftp::types::{EntryKind, EntryPermissions, EntrySubtype, ListEntry};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PERMS: Regex = Regex::new(r"^[-dlbcps][-rwxsStTlL]{9}[+@.]?(\s|$)").unwrap();
    static ref TOTAL: Regex = Regex::new(r"^total\s+\d+").unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap();
}

/// Whether `line` starts with an `ls -l` mode string.
pub fn has_mode_prefix(line: &str) -> bool {
    PERMS.is_match(line)
}

pub fn looks_like(sample: &[&str]) -> bool {
    content_lines(sample)
        .find(|l| !TOTAL.is_match(l))
        .map(|l| PERMS.is_match(l))
        .unwrap_or(false)
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Date starting at token `j`: returns the parsed value and the number of
/// tokens it spans.
fn date_at(toks: &[(usize, usize, &str)], j: usize, now: DateTime<Utc>) -> Option<(Option<DateTime<Utc>>, usize)> {
    let first = toks.get(j)?.2;

    if let Some(caps) = ISO_DATE.captures(first) {
        // `ls --time-style=long-iso`: 2011-09-27 10:02
        let (h, m, _) = parse_clock(toks.get(j + 1)?.2)?;
        let dt = datetime(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?, h, m, 0);
        return Some((dt, 2));
    }

    if first.len() != 3 {
        return None;
    }
    let month = month_from_abbrev(first)?;
    let day_tok = toks.get(j + 1)?.2;
    if !is_number(day_tok) || day_tok.len() > 2 {
        return None;
    }
    let day: u32 = day_tok.parse().ok()?;
    let last = toks.get(j + 2)?.2;
    let dt = if last.contains(':') {
        let (h, m, _) = parse_clock(last)?;
        recent_date(month, day, h, m, now)
    } else if is_number(last) && last.len() == 4 {
        datetime(last.parse().ok()?, month, day, 0, 0, 0)
    } else {
        return None;
    };
    Some((dt, 3))
}

pub fn parse_line(line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
    if line.trim().is_empty() || TOTAL.is_match(line) {
        return LineOutcome::Skip;
    }
    if !PERMS.is_match(line) {
        return LineOutcome::Invalid;
    }

    let toks = tokens(line);
    let perms = &toks[0].2[..10];

    // Find "<size> <date>": the first numeric token followed by a date.
    let mut found = None;
    for j in 2..toks.len() {
        if !is_number(toks[j - 1].2) {
            continue;
        }
        if let Some((dt, span)) = date_at(&toks, j, ctx.now) {
            found = Some((j, dt, span));
            break;
        }
    }
    let Some((j, modified, span)) = found else {
        return LineOutcome::Invalid;
    };
    let Some(&(_, date_end, _)) = toks.get(j + span - 1) else {
        return LineOutcome::Invalid;
    };
    let name_part = line[date_end..].trim_start();
    if name_part.is_empty() {
        return LineOutcome::Invalid;
    }

    let kind = match perms.as_bytes()[0] {
        b'd' => EntryKind::Directory,
        b'l' => EntryKind::Link,
        b'-' => EntryKind::File,
        _ => EntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_part.split_once(" -> ")) {
        (EntryKind::Link, Some((n, t))) => (n.to_string(), Some(t.to_string())),
        _ => (name_part.to_string(), None),
    };

    let mut entry = ListEntry::new(name, kind, line);
    entry.size = toks[j - 1].2.parse().unwrap_or(ListEntry::UNKNOWN_SIZE);
    entry.modified = modified;
    entry.permissions = Some(EntryPermissions::from_unix(perms));
    entry.link_target = link_target;

    // Between the permissions and the size: [links] [owner] [group].
    let middle: Vec<&str> = toks[1..j - 1].iter().map(|t| t.2).collect();
    let (owner, group) = match middle.as_slice() {
        [links, owner, group, ..] if is_number(links) => (Some(*owner), Some(*group)),
        [links, owner] if is_number(links) => (Some(*owner), None),
        [owner, group] => (Some(*owner), Some(*group)),
        [single] if !is_number(single) => (Some(*single), None),
        _ => (None, None),
    };
    entry.owner = owner.map(str::to_string);
    entry.group = group.map(str::to_string);

    entry.subtype = match entry.name.as_str() {
        "." => EntrySubtype::SelfDir,
        ".." => EntrySubtype::ParentDir,
        _ => EntrySubtype::None,
    };
    LineOutcome::Entry(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::listing::dates::datetime;
    use crate::ftp::listing::format::DialectState;

    fn ctx(dialect: &DialectState) -> ParseContext<'_> {
        ParseContext {
            directory: "/home/user1",
            dialect,
            vms_strip_version: true,
            now: datetime(2026, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn entry(line: &str) -> ListEntry {
        let d = DialectState::default();
        match parse_line(line, &ctx(&d)) {
            LineOutcome::Entry(e) => e,
            other => panic!("{:?} for {}", other, line),
        }
    }

    #[test]
    fn full_line_with_self_dir() {
        let e = entry("drwxr-xr-x 7 user1 user1 512 Sep 27 2011 .");
        assert_eq!(e.name, ".");
        assert_eq!(e.kind, EntryKind::Directory);
        assert_eq!(e.subtype, EntrySubtype::SelfDir);
        assert_eq!(e.size, 512);
        assert_eq!(e.owner.as_deref(), Some("user1"));
        assert_eq!(e.group.as_deref(), Some("user1"));
        assert_eq!(e.modified, datetime(2011, 9, 27, 0, 0, 0));
        assert_eq!(e.permissions.unwrap().mode, Some(0o755));
    }

    #[test]
    fn recent_file_with_spaces_in_name() {
        let e = entry("-rw-r--r--   1 ftp  ftp      4096 Mar  2 14:20 my notes.txt");
        assert_eq!(e.name, "my notes.txt");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 4096);
        assert_eq!(e.modified, datetime(2026, 3, 2, 14, 20, 0));
    }

    #[test]
    fn symlink_target() {
        let e = entry("lrwxrwxrwx 1 root root 7 Jan 1 2020 bin -> usr/bin");
        assert_eq!(e.kind, EntryKind::Link);
        assert_eq!(e.name, "bin");
        assert_eq!(e.link_target.as_deref(), Some("usr/bin"));
    }

    #[test]
    fn missing_link_count_and_group() {
        let e = entry("-rw-r--r-- owner 1234 Dec 31 2019 a.bin");
        assert_eq!(e.owner.as_deref(), Some("owner"));
        assert!(e.group.is_none());
        assert_eq!(e.size, 1234);

        let e = entry("drwxr-xr-x 2 0 Jan 5 2021 empty");
        assert!(e.owner.is_none());
        assert_eq!(e.size, 0);
    }

    #[test]
    fn long_iso_dates() {
        let e = entry("-rw-r--r-- 1 a b 10 2011-09-27 10:02 iso.txt");
        assert_eq!(e.modified, datetime(2011, 9, 27, 10, 2, 0));
        assert_eq!(e.name, "iso.txt");
    }

    #[test]
    fn total_and_garbage() {
        let d = DialectState::default();
        assert_eq!(parse_line("total 24", &ctx(&d)), LineOutcome::Skip);
        assert_eq!(parse_line("03-07-13 10:02AM 901 File01.xml", &ctx(&d)), LineOutcome::Invalid);
        assert_eq!(parse_line("drwxr-xr-x no date here", &ctx(&d)), LineOutcome::Invalid);
    }

    #[test]
    fn detection() {
        assert!(looks_like(&["total 8", "drwxr-xr-x 2 a b 4096 Jan 1 2020 x"]));
        assert!(!looks_like(&["03-07-13 10:02AM <DIR> Docs"]));
        assert!(!looks_like(&["total 0"]));
    }
}
