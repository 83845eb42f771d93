//! OpenVMS listings.
//!
//! ```text
//! Directory USER1:[TEST]
//!
//! TEL_4114.TXT;1         1178  21-MAR-2012 15:19 [TBMS,TBMS_BOSS] (RWED,RWED,,RE)
//! SUBDIR.DIR;1              1   5-MAR-1999 10:57 [SYSTEM]          (RWE,RWE,RE,RE)
//!
//! Total of 2 files, 1179 blocks.
//! ```
//!
//! Sizes are in 512-byte blocks. Long names wrap: the attributes continue
//! on the next, indented line, which the engine joins before parsing.

use crate::ftp::listing::dates::{datetime, month_from_abbrev, parse_clock};
use crate::ftp::listing::format::{content_lines, LineOutcome, ParseContext};
use crate::ftp::types::{EntryKind, EntryPermissions, ListEntry};
use lazy_static::lazy_static;
use regex::Regex;

const BLOCK_SIZE: i64 = 512;

lazy_static! {
    static ref NAME: Regex = Regex::new(r"^[^\s;]+;\d+").unwrap();
    static ref LINE: Regex = Regex::new(
        r"^(?P<name>[^\s;]+);(?P<ver>\d+)\s+(?P<size>\d+)(?:/\d+)?\s+(?P<day>\d{1,2})-(?P<mon>[A-Za-z]{3})-(?P<year>\d{4})\s+(?P<time>\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?)(?:\s+\[(?P<uic>[^\]]*)\])?(?:\s+\((?P<perms>[^)]*)\))?"
    )
    .unwrap();
}

fn is_header_or_footer(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("Directory ") || t.starts_with("Total of ") || t.starts_with("Grand total")
}

pub fn looks_like(sample: &[&str]) -> bool {
    content_lines(sample)
        .find(|l| !is_header_or_footer(l))
        .map(|l| NAME.is_match(l))
        .unwrap_or(false)
}

/// `(RWED,RWED,,RE)` (system, owner, group, world) → Unix-style mode of
/// owner/group/world; D (delete) has no Unix counterpart.
fn decode_protection(raw: &str) -> EntryPermissions {
    let classes: Vec<&str> = raw.split(',').collect();
    let mode = if classes.len() == 4 {
        let bits = |s: &str| {
            let mut v = 0u32;
            for c in s.chars() {
                match c {
                    'R' => v |= 4,
                    'W' => v |= 2,
                    'E' => v |= 1,
                    _ => {}
                }
            }
            v
        };
        Some(bits(classes[1]) << 6 | bits(classes[2]) << 3 | bits(classes[3]))
    } else {
        None
    };
    EntryPermissions {
        raw: format!("({})", raw),
        mode,
    }
}

pub fn parse_line(line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
    if line.trim().is_empty() || is_header_or_footer(line) {
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

    let base = &caps["name"];
    let (kind, base) = match base.strip_suffix(".DIR") {
        Some(stem) => (EntryKind::Directory, stem),
        None => (EntryKind::File, base),
    };
    let name = if ctx.vms_strip_version || kind == EntryKind::Directory {
        base.to_string()
    } else {
        format!("{};{}", base, &caps["ver"])
    };

    let mut entry = ListEntry::new(name, kind, line);
    entry.size = caps["size"]
        .parse::<i64>()
        .ok()
        .and_then(|blocks| blocks.checked_mul(BLOCK_SIZE))
        .unwrap_or(ListEntry::UNKNOWN_SIZE);
    entry.modified = datetime(year, month, day, h, m, s);

    if let Some(uic) = caps.name("uic") {
        match uic.as_str().split_once(',') {
            Some((group, owner)) => {
                entry.group = Some(group.trim().to_string());
                entry.owner = Some(owner.trim().to_string());
            }
            None => entry.owner = Some(uic.as_str().trim().to_string()),
        }
    }
    if let Some(perms) = caps.name("perms") {
        entry.permissions = Some(decode_protection(perms.as_str()));
    }
    LineOutcome::Entry(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::listing::format::DialectState;
    use chrono::Utc;

    fn parse(line: &str, strip: bool) -> LineOutcome {
        let d = DialectState::default();
        let ctx = ParseContext {
            directory: "USER1:[TEST]",
            dialect: &d,
            vms_strip_version: strip,
            now: Utc::now(),
        };
        parse_line(line, &ctx)
    }

    #[test]
    fn file_entry() {
        let line = "TEL_4114.TXT;1 1178 21-MAR-2012 15:19 [TBMS,TBMS_BOSS] (RWED,RWED,,RE)";
        let LineOutcome::Entry(e) = parse(line, true) else {
            panic!("not parsed");
        };
        assert_eq!(e.name, "TEL_4114.TXT");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 1178 * 512);
        assert_eq!(e.modified, datetime(2012, 3, 21, 15, 19, 0));
        assert_eq!(e.group.as_deref(), Some("TBMS"));
        assert_eq!(e.owner.as_deref(), Some("TBMS_BOSS"));
        assert_eq!(e.permissions.unwrap().mode, Some(0o705));

        let LineOutcome::Entry(v) = parse(line, false) else {
            panic!("not parsed");
        };
        assert_eq!(v.name, "TEL_4114.TXT;1");
    }

    #[test]
    fn directory_entry_with_used_allocated_size() {
        let line = "SUBDIR.DIR;1   1/3   5-MAR-1999 10:57:03.12 [SYSTEM] (RWE,RWE,RE,RE)";
        let LineOutcome::Entry(e) = parse(line, false) else {
            panic!("not parsed");
        };
        assert_eq!(e.name, "SUBDIR");
        assert_eq!(e.kind, EntryKind::Directory);
        assert_eq!(e.size, 512);
        assert_eq!(e.owner.as_deref(), Some("SYSTEM"));
        assert_eq!(e.modified, datetime(1999, 3, 5, 10, 57, 3));
    }

    #[test]
    fn joined_continuation_line() {
        // The engine joins "NAME;1" and the indented attribute line.
        let joined = "A_VERY_LONG_FILE_NAME_THAT_WRAPS.DAT;12 15 21-MAR-2012 15:19 [TBMS,TBMS_BOSS] (RWED,RWED,,RE)";
        let LineOutcome::Entry(e) = parse(joined, true) else {
            panic!("not parsed");
        };
        assert_eq!(e.name, "A_VERY_LONG_FILE_NAME_THAT_WRAPS.DAT");
        assert_eq!(e.size, 15 * 512);
    }

    #[test]
    fn oversized_block_count_has_unknown_size() {
        let line = "HUGE.TXT;1 99999999999999999 21-MAR-2012 15:19 [A,B] (RWED,RWED,,RE)";
        let LineOutcome::Entry(e) = parse(line, true) else {
            panic!("not parsed");
        };
        assert_eq!(e.name, "HUGE.TXT");
        assert_eq!(e.size, ListEntry::UNKNOWN_SIZE);
    }

    #[test]
    fn headers_footers_and_detection() {
        assert_eq!(parse("Directory USER1:[TEST]", true), LineOutcome::Skip);
        assert_eq!(parse("Total of 2 files, 1179 blocks.", true), LineOutcome::Skip);
        assert_eq!(parse("TEL_4114.TXT;1", true), LineOutcome::Invalid);
        assert!(looks_like(&["Directory USER1:[TEST]", "", "TEL_4114.TXT;1 1178 21-MAR-2012 15:19"]));
        assert!(!looks_like(&["-rw-r--r-- 1 a b 1 Jan 1 2020 x;1"]));
    }
}
