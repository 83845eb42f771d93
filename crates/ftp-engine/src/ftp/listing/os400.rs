//! IBM OS/400 (IBM i) listings.
//!
//! ```text
//! QSYS           77824 02/23/00 15:09:55 *DIR       QSYS.LIB/
//! QDOC           24576 09/20/99 13:19:13 *FLR       QDOC/
//! QSYS                                   *MEM       QSYS.LIB/QGPL.LIB/QCLSRC.FILE/A.MBR
//! ```
//!
//! The date field order follows the job's settings and can change between
//! sessions, so a date that does not fit the current order but fits
//! another switches the dialect.

use crate::ftp::listing::dates::{datetime, expand_year, parse_clock};
use crate::ftp::listing::format::{content_lines, tokens, DialectState, LineOutcome, Os400DateOrder, ParseContext};
use crate::ftp::types::{EntryKind, ListEntry};
use chrono::{DateTime, Utc};

const DIRECTORY_TYPES: [&str; 4] = ["*DIR", "*DDIR", "*LIB", "*FLR"];

fn is_object_type(tok: &str) -> bool {
    tok.len() > 1 && tok.starts_with('*') && tok[1..].bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

pub fn looks_like(sample: &[&str]) -> bool {
    content_lines(sample).next().map_or(false, |l| {
        let toks = tokens(l);
        (toks.len() >= 6 && is_object_type(toks[4].2)) || (toks.len() >= 3 && is_object_type(toks[1].2))
    })
}

fn date_in_order(date: &str, time: &str, order: Os400DateOrder) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = date.split(|c| c == '/' || c == '.' || c == '-').collect();
    let [a, b, c] = parts.as_slice() else {
        return None;
    };
    let (y, m, d) = match order {
        Os400DateOrder::MonthDayYear => (c, a, b),
        Os400DateOrder::DayMonthYear => (c, b, a),
        Os400DateOrder::YearMonthDay => (a, b, c),
    };
    let year = expand_year(y.parse().ok()?);
    let (h, mi, s) = parse_clock(time)?;
    datetime(year, m.parse().ok()?, d.parse().ok()?, h, mi, s)
}

const ORDERS: [Os400DateOrder; 3] = [
    Os400DateOrder::MonthDayYear,
    Os400DateOrder::DayMonthYear,
    Os400DateOrder::YearMonthDay,
];

pub fn parse_line(line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
    if line.trim().is_empty() {
        return LineOutcome::Skip;
    }
    let toks = tokens(line);

    // owner size date time *TYPE name, or the short member form
    // owner *TYPE name.
    let (owner, size, modified, type_idx) = if toks.len() >= 6 && is_object_type(toks[4].2) {
        let (date, time) = (toks[2].2, toks[3].2);
        let modified = match date_in_order(date, time, ctx.dialect.os400_dates) {
            Some(dt) => Some(dt),
            None => {
                let other = ORDERS
                    .iter()
                    .copied()
                    .filter(|o| *o != ctx.dialect.os400_dates)
                    .find(|o| date_in_order(date, time, *o).is_some());
                return match other {
                    Some(order) => LineOutcome::Switch(DialectState {
                        os400_dates: order,
                        ..ctx.dialect.clone()
                    }),
                    None => LineOutcome::Invalid,
                };
            }
        };
        let Ok(size) = toks[1].2.parse::<i64>() else {
            return LineOutcome::Invalid;
        };
        (toks[0].2, size, modified, 4)
    } else if toks.len() >= 3 && is_object_type(toks[1].2) {
        (toks[0].2, ListEntry::UNKNOWN_SIZE, None, 1)
    } else {
        return LineOutcome::Invalid;
    };

    let object_type = toks[type_idx].2;
    let name_start = toks[type_idx + 1].0;
    let raw_name = line[name_start..].trim_end();
    let is_dir = DIRECTORY_TYPES.contains(&object_type) || raw_name.ends_with('/');
    let name = raw_name.trim_end_matches('/');
    if name.is_empty() {
        return LineOutcome::Invalid;
    }

    let kind = if is_dir { EntryKind::Directory } else { EntryKind::File };
    let mut entry = ListEntry::new(name, kind, line);
    entry.size = size;
    entry.modified = modified;
    entry.owner = Some(owner.to_string());
    entry.facts.insert("os400.type".to_string(), object_type.to_string());
    LineOutcome::Entry(entry)
}
