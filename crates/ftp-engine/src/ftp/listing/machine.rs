//! RFC 3659 machine listings (MLSD bodies and the MLST fact line).
//!
//! ```text
//! type=cdir;modify=20260101120000;unix.mode=0755; /home/user1
//! type=file;size=1024;modify=20120321151900;unix.mode=0644; notes.txt
//! type=OS.unix=slink:/usr/bin;modify=20200101000000; bin
//! ```

use crate::ftp::listing::format::{content_lines, LineOutcome, ParseContext};
use crate::ftp::reply::parse_machine_time;
use crate::ftp::types::{EntryKind, EntryPermissions, EntrySubtype, ListEntry};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref FACTS: Regex = Regex::new(r"^([A-Za-z0-9.\-]+=[^;]*;)+ \S").unwrap();
}

pub fn looks_like(sample: &[&str]) -> bool {
    content_lines(sample).next().map_or(false, |l| FACTS.is_match(l))
}

/// Split `facts; name` into lower-cased fact keys and the name.
pub fn split_facts(line: &str) -> Option<(HashMap<String, String>, &str)> {
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }
    let mut map = HashMap::new();
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = fact.split_once('=')?;
        map.insert(key.to_ascii_lowercase(), value.to_string());
    }
    Some((map, name))
}

pub fn parse_line(line: &str, _ctx: &ParseContext<'_>) -> LineOutcome {
    if line.trim().is_empty() {
        return LineOutcome::Skip;
    }
    let Some((facts, name)) = split_facts(line) else {
        return LineOutcome::Invalid;
    };
    let Some(kind_fact) = facts.get("type") else {
        return LineOutcome::Invalid;
    };

    let lower = kind_fact.to_ascii_lowercase();
    let (kind, subtype, link_target) = match lower.as_str() {
        "file" => (EntryKind::File, EntrySubtype::None, None),
        "dir" => (EntryKind::Directory, EntrySubtype::SubDir, None),
        "cdir" => (EntryKind::Directory, EntrySubtype::SelfDir, None),
        "pdir" => (EntryKind::Directory, EntrySubtype::ParentDir, None),
        t if t.starts_with("os.unix=slink") || t.starts_with("os.unix=symlink") => {
            let target = kind_fact
                .split_once(':')
                .map(|(_, t)| t.to_string())
                .filter(|t| !t.is_empty());
            (EntryKind::Link, EntrySubtype::None, target)
        }
        _ => (EntryKind::Unknown, EntrySubtype::None, None),
    };

    let mut entry = ListEntry::new(name, kind, line);
    entry.subtype = subtype;
    entry.link_target = link_target;
    entry.size = facts
        .get("size")
        .or_else(|| facts.get("sizd"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(ListEntry::UNKNOWN_SIZE);
    entry.modified = facts.get("modify").and_then(|s| parse_machine_time(s));
    entry.created = facts.get("create").and_then(|s| parse_machine_time(s));
    entry.permissions = match (facts.get("unix.mode"), facts.get("perm")) {
        (Some(mode), _) => Some(EntryPermissions::from_octal(mode)),
        (None, Some(perm)) => Some(EntryPermissions {
            raw: perm.clone(),
            mode: None,
        }),
        (None, None) => None,
    };
    entry.owner = facts.get("unix.owner").or_else(|| facts.get("unix.uid")).cloned();
    entry.group = facts.get("unix.group").or_else(|| facts.get("unix.gid")).cloned();
    entry.facts = facts;
    LineOutcome::Entry(entry)
}
