//! IBM z/OS (MVS) listings.
//!
//! One server prints several unrelated layouts, each introduced by a
//! header line, and the header decides how the following lines are read:
//!
//! ```text
//! Volume Unit    Referred Ext Used Recfm Lrecl BlkSz Dsorg Dsname
//! WYOSPT 3390   2008/03/20  2   15  FB     133 27930  PO  JOHN.LOADLIB
//! Migrated                                                JOHN.OLD.DATA
//!
//!  Name     VV.MM   Created       Changed      Size  Init   Mod   Id
//! MEMBER1   01.03 2002/12/17 2003/03/26 14:24    25    12     0 JOHN
//!
//!  Name      Size     TTR   Alias-of AC --------- Attributes --------- Amode Rmode
//! IEFBR14   000008   00000E          00 FO             RN RU            31    ANY
//! ```
//!
//! Anything under `total N` is the z/OS UNIX file system and reads as
//! `ls -l`.

use crate::ftp::listing::dates::{datetime, parse_clock};
use crate::ftp::listing::format::{tokens, DialectState, LineOutcome, ParseContext, ZosRealm};
use crate::ftp::listing::unix;
use crate::ftp::types::{EntryKind, ListEntry};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

/// Bytes per 3390 track; dataset sizes are reported in tracks.
const TRACK_BYTES: i64 = 56_664;

lazy_static! {
    static ref DATASETS_HEADER: Regex = Regex::new(r"^\s*Volume\s+Unit\s+").unwrap();
    static ref MEMBERS_HEADER: Regex = Regex::new(r"^\s*Name\s+VV\.MM\s+").unwrap();
    static ref LOAD_HEADER: Regex = Regex::new(r"^\s*Name\s+Size\s+TTR\s+").unwrap();
    static ref UNIX_HEADER: Regex = Regex::new(r"^total\s+\d+").unwrap();
    static ref YMD: Regex = Regex::new(r"^(\d{4})/(\d{2})/(\d{2})$").unwrap();
}

/// Realm announced by a header line, if the line is one.
pub fn header_realm(line: &str) -> Option<ZosRealm> {
    if DATASETS_HEADER.is_match(line) {
        Some(ZosRealm::Datasets)
    } else if MEMBERS_HEADER.is_match(line) {
        Some(ZosRealm::Members)
    } else if LOAD_HEADER.is_match(line) {
        Some(ZosRealm::LoadModules)
    } else if UNIX_HEADER.is_match(line) {
        Some(ZosRealm::Unix)
    } else {
        None
    }
}

pub fn looks_like(sample: &[&str]) -> bool {
    sample
        .iter()
        .filter_map(|l| header_realm(l))
        .any(|r| r != ZosRealm::Unix)
}

/// Dataset name without quotes: `'JOHN.PDS'` → `JOHN.PDS`.
pub fn unquote(name: &str) -> &str {
    name.trim().trim_matches('\'')
}

fn ymd(date: &str, time: Option<&str>) -> Option<DateTime<Utc>> {
    let caps = YMD.captures(date)?;
    let (h, m, s) = match time {
        Some(t) => parse_clock(t)?,
        None => (0, 0, 0),
    };
    datetime(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?, h, m, s)
}

/// Fully qualified dataset: quoted names are absolute, others are
/// relative to the high-level qualifier being listed.
fn qualify(ctx: &ParseContext<'_>, dsname: &str) -> String {
    if dsname.starts_with('\'') {
        return format!("'{}'", unquote(dsname));
    }
    let prefix = unquote(ctx.directory).trim_end_matches('.');
    if prefix.is_empty() || prefix == "/" {
        format!("'{}'", dsname)
    } else {
        format!("'{}.{}'", prefix, dsname)
    }
}

fn parse_dataset(line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
    let toks = tokens(line);
    let Some(&(_, _, last)) = toks.last() else {
        return LineOutcome::Skip;
    };

    // Catalogued but not on disk: name only, type unknown.
    let special = line.starts_with("Migrated")
        || line.starts_with("Pseudo Directory")
        || line.contains("Not Direct Access")
        || line.contains("Error determining attributes");
    if special {
        let kind = if line.starts_with("Pseudo Directory") {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let name = unquote(last);
        let mut entry = ListEntry::new(name, kind, line);
        entry.full_path = qualify(ctx, last);
        return LineOutcome::Entry(entry);
    }

    if toks.len() != 10 {
        return LineOutcome::Invalid;
    }
    let [volume, _unit, referred, _ext, used, recfm, lrecl, blksize, dsorg, dsname] =
        [0, 1, 2, 3, 4, 5, 6, 7, 8, 9].map(|i| toks[i].2);
    let Ok(used) = used.parse::<i64>() else {
        return LineOutcome::Invalid;
    };
    if YMD.captures(referred).is_none() && referred != "**NONE**" {
        return LineOutcome::Invalid;
    }

    let kind = if dsorg == "PO" || dsorg == "PO-E" {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let mut entry = ListEntry::new(unquote(dsname), kind, line);
    entry.full_path = qualify(ctx, dsname);
    entry.size = used.checked_mul(TRACK_BYTES).unwrap_or(ListEntry::UNKNOWN_SIZE);
    entry.modified = ymd(referred, None);
    for (key, value) in [
        ("zos.volume", volume),
        ("zos.recfm", recfm),
        ("zos.lrecl", lrecl),
        ("zos.blksize", blksize),
        ("zos.dsorg", dsorg),
    ] {
        entry.facts.insert(key.to_string(), value.to_string());
    }
    LineOutcome::Entry(entry)
}

fn member_path(ctx: &ParseContext<'_>, member: &str) -> String {
    format!("'{}({})'", unquote(ctx.directory), member)
}

fn parse_member(line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
    let toks = tokens(line);
    match toks.len() {
        // Members saved without ISPF statistics.
        1 => {
            let name = toks[0].2;
            let mut entry = ListEntry::new(name, EntryKind::File, line);
            entry.full_path = member_path(ctx, name);
            LineOutcome::Entry(entry)
        }
        9 => {
            let name = toks[0].2;
            let Some(modified) = ymd(toks[3].2, Some(toks[4].2)) else {
                return LineOutcome::Invalid;
            };
            let Ok(records) = toks[5].2.parse::<i64>() else {
                return LineOutcome::Invalid;
            };
            let mut entry = ListEntry::new(name, EntryKind::File, line);
            entry.full_path = member_path(ctx, name);
            entry.modified = Some(modified);
            entry.created = ymd(toks[2].2, None);
            entry.owner = Some(toks[8].2.to_string());
            entry.size = match &ctx.dialect.zos_record_length {
                Some((dataset, lrecl)) if *lrecl > 0 && dataset == unquote(ctx.directory) => records
                    .checked_mul(i64::from(*lrecl))
                    .unwrap_or(ListEntry::UNKNOWN_SIZE),
                _ => ListEntry::UNKNOWN_SIZE,
            };
            entry.facts.insert("zos.records".to_string(), records.to_string());
            LineOutcome::Entry(entry)
        }
        _ => LineOutcome::Invalid,
    }
}

fn parse_load_module(line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
    let toks = tokens(line);
    if toks.len() < 3 {
        return LineOutcome::Invalid;
    }
    let name = toks[0].2;
    let Ok(size) = i64::from_str_radix(toks[1].2, 16) else {
        return LineOutcome::Invalid;
    };
    if i64::from_str_radix(toks[2].2, 16).is_err() {
        return LineOutcome::Invalid;
    }
    let mut entry = ListEntry::new(name, EntryKind::File, line);
    entry.full_path = member_path(ctx, name);
    entry.size = size;
    LineOutcome::Entry(entry)
}

pub fn parse_line(line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
    if line.trim().is_empty() {
        return LineOutcome::Skip;
    }
    if let Some(realm) = header_realm(line) {
        if realm == ctx.dialect.zos_realm {
            return LineOutcome::Skip;
        }
        return LineOutcome::Switch(DialectState {
            zos_realm: realm,
            ..ctx.dialect.clone()
        });
    }
    match ctx.dialect.zos_realm {
        ZosRealm::Datasets => parse_dataset(line, ctx),
        ZosRealm::Members => parse_member(line, ctx),
        ZosRealm::LoadModules => parse_load_module(line, ctx),
        ZosRealm::Unix => unix::parse_line(line, ctx),
        ZosRealm::Unknown => LineOutcome::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(dir: &'a str, d: &'a DialectState) -> ParseContext<'a> {
        ParseContext {
            directory: dir,
            dialect: d,
            vms_strip_version: true,
            now: Utc::now(),
        }
    }

    fn realm(r: ZosRealm) -> DialectState {
        DialectState {
            zos_realm: r,
            ..Default::default()
        }
    }

    #[test]
    fn header_switches_realm() {
        let d = DialectState::default();
        let header = "Volume Unit    Referred Ext Used Recfm Lrecl BlkSz Dsorg Dsname";
        let LineOutcome::Switch(next) = parse_line(header, &ctx("'JOHN.'", &d)) else {
            panic!("expected switch");
        };
        assert_eq!(next.zos_realm, ZosRealm::Datasets);
        assert_eq!(parse_line(header, &ctx("'JOHN.'", &next)), LineOutcome::Skip);
    }

    #[test]
    fn datasets() {
        let d = realm(ZosRealm::Datasets);
        let c = ctx("'JOHN.'", &d);
        let LineOutcome::Entry(pds) = parse_line("WYOSPT 3390   2008/03/20  2   15  FB     133 27930  PO  LOADLIB", &c) else {
            panic!("not parsed");
        };
        assert_eq!(pds.name, "LOADLIB");
        assert_eq!(pds.full_path, "'JOHN.LOADLIB'");
        assert_eq!(pds.kind, EntryKind::Directory);
        assert_eq!(pds.size, 15 * TRACK_BYTES);
        assert_eq!(pds.modified, datetime(2008, 3, 20, 0, 0, 0));

        let LineOutcome::Entry(ps) = parse_line("WYOSPT 3420 2003/10/03 1 1 FB 80 8000 PS 'JOHN.TEST.DATA'", &c) else {
            panic!("not parsed");
        };
        assert_eq!(ps.kind, EntryKind::File);
        assert_eq!(ps.full_path, "'JOHN.TEST.DATA'");

        let LineOutcome::Entry(mig) = parse_line("Migrated                                                OLD.DATA", &c) else {
            panic!("not parsed");
        };
        assert_eq!(mig.full_path, "'JOHN.OLD.DATA'");
        assert_eq!(mig.size, ListEntry::UNKNOWN_SIZE);

        let LineOutcome::Entry(pseudo) = parse_line("Pseudo Directory                                        GRP", &c) else {
            panic!("not parsed");
        };
        assert_eq!(pseudo.kind, EntryKind::Directory);
    }

    #[test]
    fn members_use_record_length_when_known() {
        let mut d = realm(ZosRealm::Members);
        let line = "MEMBER1   01.03 2002/12/17 2003/03/26 14:24    25    12     0 JOHN";
        let LineOutcome::Entry(e) = parse_line(line, &ctx("'JOHN.PDS'", &d)) else {
            panic!("not parsed");
        };
        assert_eq!(e.full_path, "'JOHN.PDS(MEMBER1)'");
        assert_eq!(e.size, ListEntry::UNKNOWN_SIZE);
        assert_eq!(e.modified, datetime(2003, 3, 26, 14, 24, 0));
        assert_eq!(e.owner.as_deref(), Some("JOHN"));

        d.zos_record_length = Some(("JOHN.PDS".to_string(), 80));
        let LineOutcome::Entry(e) = parse_line(line, &ctx("'JOHN.PDS'", &d)) else {
            panic!("not parsed");
        };
        assert_eq!(e.size, 25 * 80);

        let LineOutcome::Entry(bare) = parse_line("NOSTATS", &ctx("'JOHN.PDS'", &d)) else {
            panic!("not parsed");
        };
        assert_eq!(bare.name, "NOSTATS");
    }

    #[test]
    fn oversized_counts_have_unknown_size() {
        let d = realm(ZosRealm::Datasets);
        let line = "WYOSPT 3390 2008/03/20 2 9999999999999999 FB 80 27930 PS BIG.DATA";
        let LineOutcome::Entry(ds) = parse_line(line, &ctx("'JOHN.'", &d)) else {
            panic!("not parsed");
        };
        assert_eq!(ds.size, ListEntry::UNKNOWN_SIZE);

        let mut d = realm(ZosRealm::Members);
        d.zos_record_length = Some(("JOHN.PDS".to_string(), 32760));
        let line = "MEMBER1   01.03 2002/12/17 2003/03/26 14:24 999999999999999999 12 0 JOHN";
        let LineOutcome::Entry(m) = parse_line(line, &ctx("'JOHN.PDS'", &d)) else {
            panic!("not parsed");
        };
        assert_eq!(m.size, ListEntry::UNKNOWN_SIZE);
        assert_eq!(m.facts.get("zos.records").map(String::as_str), Some("999999999999999999"));
    }

    #[test]
    fn load_modules_have_hex_sizes() {
        let d = realm(ZosRealm::LoadModules);
        let line = "IEFBR14   000010   00000E          00 FO             RN RU            31    ANY";
        let LineOutcome::Entry(e) = parse_line(line, &ctx("'SYS1.LINKLIB'", &d)) else {
            panic!("not parsed");
        };
        assert_eq!(e.size, 16);
        assert_eq!(e.full_path, "'SYS1.LINKLIB(IEFBR14)'");
    }

    #[test]
    fn unix_realm_delegates() {
        let d = realm(ZosRealm::Unix);
        let LineOutcome::Entry(e) = parse_line("-rw-r--r-- 1 JOHN SYS1 10 Jan 1 2020 a.txt", &ctx("/u/john", &d)) else {
            panic!("not parsed");
        };
        assert_eq!(e.name, "a.txt");
    }

    #[test]
    fn detection() {
        assert!(looks_like(&[" Name     VV.MM   Created       Changed      Size  Init   Mod   Id"]));
        assert!(!looks_like(&["total 4", "-rw-r--r-- 1 a b 1 Jan 1 2020 x"]));
    }
}
