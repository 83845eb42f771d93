//! Listing engine: picks a dialect, parses raw listing lines into
//! [`ListEntry`] values and resolves their paths.
//!
//! The engine never touches the network. When a dialect needs extra
//! information from the server (z/OS record lengths) it returns
//! [`ListingStep::Auxiliary`] and the session runs the command and hands
//! the reply back through [`supply_auxiliary`].

pub mod dates;
pub mod format;
pub mod machine;
pub mod nonstop;
pub mod os400;
pub mod unix;
pub mod vms;
pub mod windows;
pub mod zos;

pub use format::{DialectState, LineOutcome, ListingFormat, Os400DateOrder, ParseContext, ZosRealm, DETECTION_ORDER};

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::logger::FtpLogSink;
use crate::ftp::types::{EntryKind, EntrySubtype, ListEntry, Reply};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::Level;
use regex::Regex;

/// Lines inspected by `looks_like` during detection.
const DETECTION_SAMPLE: usize = 10;

lazy_static! {
    static ref NOISE: Regex =
        Regex::new(r"(?i)^(total\s+\d+|.*no (files|members|data ?sets?|entries) found.*|.*empty.*)$").unwrap();
    static ref RECURSIVE_HEADER: Regex = Regex::new(r"^(\S.*):$").unwrap();
    static ref LRECL: Regex = Regex::new(r"(?i)LRECL\s*=\s*\(?\s*(\d+)").unwrap();
}

/// Directory named by an `ls -R` section header such as `./sub:`. Entry
/// lines whose name happens to end in a colon are not headers.
fn recursive_header(line: &str) -> Option<&str> {
    if unix::has_mode_prefix(line) {
        return None;
    }
    RECURSIVE_HEADER
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

// ─── Engine state ────────────────────────────────────────────────────

/// Dialect knowledge carried across listings of one session.
#[derive(Debug, Clone, Default)]
pub struct ParserLockState {
    /// Dialect of the last successful `LIST`. Machine listings are never
    /// locked since they are tied to the command, not the server.
    pub format: Option<ListingFormat>,
    /// `format` has parsed at least one real listing.
    pub confirmed: bool,
    pub dialect: DialectState,
}

impl ParserLockState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One listing to parse.
#[derive(Debug, Clone)]
pub struct ListingRequest<'a> {
    /// Directory that was listed.
    pub path: &'a str,
    /// The server was asked for, and supports, a recursive listing.
    pub recursive: bool,
    pub include_self_and_parent: bool,
    /// Parse with this dialect, no detection.
    pub forced: Option<ListingFormat>,
    /// Hint from `SYST`, tried before detection.
    pub preferred: Option<ListingFormat>,
    pub vms_strip_version: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedListing {
    pub entries: Vec<ListEntry>,
    /// `None` when the listing had no records at all.
    pub format: Option<ListingFormat>,
    /// Full restarts caused by dialect switches.
    pub restarts: u32,
}

/// A command the engine needs run before it can finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxRequest {
    pub command: String,
    pub dataset: String,
}

#[derive(Debug, Clone)]
pub enum ListingStep {
    Done(ParsedListing),
    Auxiliary(AuxRequest),
}

// ─── Path helpers ────────────────────────────────────────────────────

pub fn join_path(dir: &str, name: &str) -> String {
    if name.starts_with('/') || dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') || dir.ends_with(']') || dir.ends_with(':') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Collapse `.`/`..` segments and duplicate or trailing slashes of a
/// slash-separated path. Other path styles are returned unchanged.
pub fn normalize_path(path: &str) -> String {
    if !path.contains('/') {
        return path.to_string();
    }
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(false, |p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn resolve_header(listed: &str, header: &str) -> String {
    match header {
        "." => listed.to_string(),
        h if h.starts_with('/') => normalize_path(h),
        h => normalize_path(&join_path(listed, h.trim_start_matches("./"))),
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────

/// Fold indented lines into the record they continue.
fn logical_lines(raw: &[String], join: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for line in raw {
        let line = line.trim_end_matches(['\r', '\n']);
        let continues = join && (line.starts_with(' ') || line.starts_with('\t')) && !line.trim().is_empty();
        match out.last_mut() {
            Some(prev) if continues && !prev.trim().is_empty() => {
                prev.push(' ');
                prev.push_str(line.trim());
            }
            _ => out.push(line.to_string()),
        }
    }
    out
}

fn detect(sample: &[&str], exclude: Option<ListingFormat>) -> Option<ListingFormat> {
    DETECTION_ORDER
        .iter()
        .copied()
        .filter(|f| Some(*f) != exclude)
        .find(|f| f.looks_like(sample))
}

enum Pass {
    Parsed(Vec<ListEntry>),
    FirstRecordInvalid(String),
    NeedsRecordLength(String),
}

fn finish_entry(mut entry: ListEntry, dir: &str, format: ListingFormat) -> ListEntry {
    if entry.full_path.is_empty() {
        entry.full_path = match entry.subtype {
            EntrySubtype::SelfDir if format == ListingFormat::Machine && entry.name.starts_with('/') => {
                normalize_path(&entry.name)
            }
            EntrySubtype::SelfDir => normalize_path(dir),
            EntrySubtype::ParentDir => normalize_path(&join_path(dir, "..")),
            _ => normalize_path(&join_path(dir, &entry.name)),
        };
    }
    if entry.kind == EntryKind::Link {
        if let Some(target) = entry.link_target.take() {
            let absolute = if target.starts_with('/') || !dir.starts_with('/') {
                target
            } else {
                normalize_path(&join_path(dir, &target))
            };
            entry.link_target = Some(absolute);
        }
    }
    entry
}

fn wants_record_length(format: ListingFormat, dialect: &DialectState, path: &str) -> Option<String> {
    if format != ListingFormat::IbmZos || dialect.zos_realm != ZosRealm::Members {
        return None;
    }
    let dataset = zos::unquote(path);
    match &dialect.zos_record_length {
        Some((known, _)) if known == dataset => None,
        _ => Some(dataset.to_string()),
    }
}

/// Parse all lines under one dialect, restarting from the top whenever a
/// line switches the dialect state into one not tried before.
fn run_pass(
    format: ListingFormat,
    dialect: &mut DialectState,
    lines: &[String],
    req: &ListingRequest<'_>,
    now: DateTime<Utc>,
    restarts: &mut u32,
    sink: &dyn FtpLogSink,
) -> Pass {
    let mut tried: Vec<DialectState> = vec![dialect.clone()];

    'restart: loop {
        if let Some(dataset) = wants_record_length(format, dialect, req.path) {
            return Pass::NeedsRecordLength(dataset);
        }

        let mut entries = Vec::new();
        let mut seen_record = false;
        let listed = normalize_path(req.path);
        let mut current_dir = req.path.to_string();

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if req.recursive && format == ListingFormat::Unix {
                if let Some(dir) = recursive_header(line) {
                    current_dir = resolve_header(req.path, dir);
                    continue;
                }
            }

            let ctx = ParseContext {
                directory: &current_dir,
                dialect,
                vms_strip_version: req.vms_strip_version,
                now,
            };
            match format.parse_line(line, &ctx) {
                LineOutcome::Entry(entry) => {
                    seen_record = true;
                    let entry = finish_entry(entry, &current_dir, format);
                    let is_listed_dir =
                        entry.subtype != EntrySubtype::SubDir && normalize_path(&entry.full_path) == listed;
                    if !req.include_self_and_parent && (entry.is_self_or_parent() || is_listed_dir) {
                        continue;
                    }
                    entries.push(entry);
                }
                LineOutcome::Skip => {}
                LineOutcome::Invalid if !seen_record => {
                    return Pass::FirstRecordInvalid(line.clone());
                }
                LineOutcome::Invalid => {
                    sink.log(
                        Level::Warn,
                        &format!("{} listing: skipping unparseable line {:?}", format.name(), line),
                    );
                }
                LineOutcome::Switch(next) => {
                    if tried.contains(&next) {
                        sink.log(
                            Level::Warn,
                            &format!("{} listing: ignoring repeated dialect switch at {:?}", format.name(), line),
                        );
                        continue;
                    }
                    sink.log(
                        Level::Debug,
                        &format!("{} listing: dialect changed to {:?}, restarting", format.name(), next),
                    );
                    tried.push(next.clone());
                    *dialect = next;
                    *restarts += 1;
                    continue 'restart;
                }
            }
        }
        return Pass::Parsed(entries);
    }
}

/// Parse a raw listing.
///
/// Dialect choice: `forced`, else the locked dialect, else the `SYST`
/// preference, else detection over the first lines. If the first record
/// does not parse, detection runs once more without that dialect; a
/// second failure is an error.
pub fn parse(
    lock: &mut ParserLockState,
    raw: &[String],
    req: &ListingRequest<'_>,
    sink: &dyn FtpLogSink,
) -> FtpResult<ListingStep> {
    let sample: Vec<&str> = raw
        .iter()
        .map(|l| l.trim_end_matches(['\r', '\n']))
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !(req.recursive && recursive_header(l).is_some()))
        .take(DETECTION_SAMPLE)
        .collect();
    if sample.is_empty() {
        return Ok(ListingStep::Done(ParsedListing {
            entries: Vec::new(),
            format: lock.format,
            restarts: 0,
        }));
    }

    let locked = lock.format.filter(|_| req.forced.is_none());
    let mut format = match req.forced.or(locked).or(req.preferred) {
        Some(f) => f,
        None => match detect(&sample, None) {
            Some(f) => f,
            None if raw.iter().all(|l| l.trim().is_empty() || NOISE.is_match(l.trim())) => {
                return Ok(ListingStep::Done(ParsedListing {
                    entries: Vec::new(),
                    format: None,
                    restarts: 0,
                }));
            }
            None => {
                return Err(FtpError::listing_format(format!(
                    "no listing dialect matches {:?}",
                    sample[0]
                )))
            }
        },
    };

    let now = Utc::now();
    let mut restarts = 0;
    let mut redetected = false;
    let mut dialect = if Some(format) == lock.format {
        lock.dialect.clone()
    } else {
        DialectState::default()
    };

    loop {
        let lines = logical_lines(raw, format.joins_continuations());
        match run_pass(format, &mut dialect, &lines, req, now, &mut restarts, sink) {
            Pass::Parsed(entries) => {
                if format != ListingFormat::Machine {
                    lock.format = Some(format);
                    lock.confirmed = true;
                    lock.dialect = dialect;
                }
                return Ok(ListingStep::Done(ParsedListing {
                    entries,
                    format: Some(format),
                    restarts,
                }));
            }
            Pass::NeedsRecordLength(dataset) => {
                lock.format = Some(format);
                lock.dialect = dialect;
                return Ok(ListingStep::Auxiliary(AuxRequest {
                    command: format!("XDSS '{}'", dataset),
                    dataset,
                }));
            }
            Pass::FirstRecordInvalid(line) => {
                let retry = if redetected || req.forced.is_some() {
                    None
                } else {
                    detect(&sample, Some(format))
                };
                match retry {
                    Some(next) => {
                        sink.log(
                            Level::Info,
                            &format!(
                                "{} parser rejected {:?}; retrying as {}",
                                format.name(),
                                line,
                                next.name()
                            ),
                        );
                        if lock.format == Some(format) {
                            lock.reset();
                        }
                        redetected = true;
                        restarts += 1;
                        format = next;
                        dialect = DialectState::default();
                    }
                    None => {
                        return Err(FtpError::listing_format(format!(
                            "{} parser cannot read {:?}",
                            format.name(),
                            line
                        )))
                    }
                }
            }
        }
    }
}

/// Record the reply to an [`AuxRequest`]. A failed or unreadable reply
/// records a zero record length so the request is not repeated.
pub fn supply_auxiliary(lock: &mut ParserLockState, aux: &AuxRequest, reply: Option<&Reply>) {
    let lrecl = reply
        .filter(|r| r.is_completion())
        .and_then(|r| {
            r.info_lines
                .iter()
                .chain(std::iter::once(&r.message))
                .find_map(|l| LRECL.captures(l).and_then(|c| c[1].parse::<u32>().ok()))
        })
        .unwrap_or(0);
    lock.dialect.zos_record_length = Some((aux.dataset.clone(), lrecl));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::logger::LogFacadeSink;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    fn req(path: &str) -> ListingRequest<'_> {
        ListingRequest {
            path,
            recursive: false,
            include_self_and_parent: false,
            forced: None,
            preferred: None,
            vms_strip_version: true,
        }
    }

    fn done(step: FtpResult<ListingStep>) -> ParsedListing {
        match step {
            Ok(ListingStep::Done(p)) => p,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unix_listing_filters_self_and_parent() {
        let raw = lines(
            "total 12\n\
             drwxr-xr-x 7 user1 user1 512 Sep 27 2011 .\n\
             drwxr-xr-x 3 user1 user1 512 Sep 27 2011 ..\n\
             -rw-r--r-- 1 user1 user1 100 Sep 27 2011 a.txt\n\
             lrwxrwxrwx 1 user1 user1 5 Sep 27 2011 l -> a.txt",
        );
        let mut lock = ParserLockState::default();
        let p = done(parse(&mut lock, &raw, &req("/home/user1"), &LogFacadeSink));
        assert_eq!(p.format, Some(ListingFormat::Unix));
        let names: Vec<_> = p.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "l"]);
        assert_eq!(p.entries[0].full_path, "/home/user1/a.txt");
        assert_eq!(p.entries[1].link_target.as_deref(), Some("/home/user1/a.txt"));
        assert_eq!(lock.format, Some(ListingFormat::Unix));
        assert!(lock.confirmed);

        let mut r = req("/home/user1");
        r.include_self_and_parent = true;
        let p = done(parse(&mut lock, &raw, &r, &LogFacadeSink));
        assert_eq!(p.entries.len(), 4);
        assert_eq!(p.entries[0].name, ".");
    }

    #[test]
    fn bad_line_after_first_record_is_skipped() {
        let raw = lines(
            "-rw-r--r-- 1 u g 1 Jan 1 2020 a\n\
             garbage line\n\
             -rw-r--r-- 1 u g 2 Jan 1 2020 b",
        );
        let mut lock = ParserLockState::default();
        let p = done(parse(&mut lock, &raw, &req("/"), &LogFacadeSink));
        assert_eq!(p.entries.len(), 2);
        assert_eq!(p.entries[1].full_path, "/b");
    }

    #[test]
    fn wrong_lock_redetects_once() {
        let raw = lines("03-07-13 10:02AM 901 File01.xml");
        let mut lock = ParserLockState {
            format: Some(ListingFormat::Unix),
            confirmed: true,
            dialect: DialectState::default(),
        };
        let p = done(parse(&mut lock, &raw, &req("/"), &LogFacadeSink));
        assert_eq!(p.format, Some(ListingFormat::Windows));
        assert_eq!(p.restarts, 1);
        assert_eq!(lock.format, Some(ListingFormat::Windows));
    }

    #[test]
    fn undetectable_listing_is_an_error() {
        let mut lock = ParserLockState::default();
        let err = parse(&mut lock, &lines("what is this"), &req("/"), &LogFacadeSink).unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::ListingFormat);

        let mut r = req("/");
        r.forced = Some(ListingFormat::Windows);
        assert!(parse(&mut lock, &lines("-rw-r--r-- 1 u g 1 Jan 1 2020 a"), &r, &LogFacadeSink).is_err());
    }

    #[test]
    fn noise_only_listing_is_empty() {
        let mut lock = ParserLockState::default();
        let p = done(parse(&mut lock, &lines("total 0"), &req("/"), &LogFacadeSink));
        assert!(p.entries.is_empty());
        let p = done(parse(&mut lock, &lines(""), &req("/"), &LogFacadeSink));
        assert!(p.entries.is_empty());
    }

    #[test]
    fn vms_continuation_lines_are_joined() {
        let raw = lines(
            "Directory USER1:[TEST]\n\
             \n\
             A_VERY_LONG_FILE_NAME_THAT_WRAPS.DAT;12\n\
             \x20                     15  21-MAR-2012 15:19 [TBMS,TBMS_BOSS] (RWED,RWED,,RE)\n\
             TEL_4114.TXT;1 1178 21-MAR-2012 15:19 [TBMS,TBMS_BOSS] (RWED,RWED,,RE)\n\
             \n\
             Total of 2 files, 1193 blocks.",
        );
        let mut lock = ParserLockState::default();
        let p = done(parse(&mut lock, &raw, &req("USER1:[TEST]"), &LogFacadeSink));
        assert_eq!(p.format, Some(ListingFormat::Vms));
        assert_eq!(p.entries.len(), 2);
        assert_eq!(p.entries[0].name, "A_VERY_LONG_FILE_NAME_THAT_WRAPS.DAT");
        assert_eq!(p.entries[0].size, 15 * 512);
        assert_eq!(p.entries[1].full_path, "USER1:[TEST]TEL_4114.TXT");
    }

    #[test]
    fn os400_date_drift_restarts_exactly_once() {
        let raw = lines(
            "USER1 10 03/02/12 10:00:00 *STMF a\n\
             USER1 20 25/03/12 10:00:00 *STMF b\n\
             USER1 30 26/03/12 10:00:00 *STMF c",
        );
        let mut lock = ParserLockState::default();
        let p = done(parse(&mut lock, &raw, &req("/home/user1"), &LogFacadeSink));
        assert_eq!(p.format, Some(ListingFormat::IbmOs400));
        assert_eq!(p.restarts, 1);
        assert_eq!(p.entries.len(), 3);
        assert_eq!(p.entries[0].modified, dates::datetime(2012, 2, 3, 10, 0, 0));
        assert_eq!(lock.dialect.os400_dates, Os400DateOrder::DayMonthYear);
    }

    #[test]
    fn recursive_headers_move_the_directory() {
        let raw = lines(
            ".:\n\
             total 1\n\
             drwxr-xr-x 2 u g 512 Jan 1 2020 sub\n\
             \n\
             ./sub:\n\
             total 1\n\
             -rw-r--r-- 1 u g 5 Jan 1 2020 inner.txt",
        );
        let mut lock = ParserLockState::default();
        let mut r = req("/pub");
        r.recursive = true;
        let p = done(parse(&mut lock, &raw, &r, &LogFacadeSink));
        let paths: Vec<_> = p.entries.iter().map(|e| e.full_path.as_str()).collect();
        assert_eq!(paths, vec!["/pub/sub", "/pub/sub/inner.txt"]);
    }

    #[test]
    fn entry_named_with_trailing_colon_is_not_a_header() {
        let raw = lines(
            "-rw-r--r-- 1 u g 5 Jan 1 2020 notes:\n\
             drwxr-xr-x 2 u g 512 Jan 1 2020 sub\n\
             \n\
             ./sub:\n\
             -rw-r--r-- 1 u g 7 Jan 1 2020 inner.txt",
        );
        let mut lock = ParserLockState::default();
        let mut r = req("/pub");
        r.recursive = true;
        let p = done(parse(&mut lock, &raw, &r, &LogFacadeSink));
        let paths: Vec<_> = p.entries.iter().map(|e| e.full_path.as_str()).collect();
        assert_eq!(paths, vec!["/pub/notes:", "/pub/sub", "/pub/sub/inner.txt"]);
        assert_eq!(p.entries[0].size, 5);
        assert_eq!(p.entries[1].kind, EntryKind::Directory);

        assert_eq!(recursive_header("./sub:"), Some("./sub"));
        assert_eq!(recursive_header("-rw-r--r-- 1 u g 5 Jan 1 2020 notes:"), None);
    }

    #[test]
    fn machine_listing_is_not_locked() {
        let raw = lines(
            "type=cdir;modify=20260101120000; /pub\n\
             type=pdir; ..\n\
             type=file;size=3; x.bin",
        );
        let mut lock = ParserLockState::default();
        let mut r = req("/pub");
        r.forced = Some(ListingFormat::Machine);
        let p = done(parse(&mut lock, &raw, &r, &LogFacadeSink));
        assert_eq!(p.entries.len(), 1);
        assert_eq!(p.entries[0].full_path, "/pub/x.bin");
        assert!(lock.format.is_none());
    }

    #[test]
    fn zos_members_request_record_length() {
        let raw = lines(
            " Name     VV.MM   Created       Changed      Size  Init   Mod   Id\n\
             MEMBER1   01.03 2002/12/17 2003/03/26 14:24    25    12     0 JOHN",
        );
        let mut lock = ParserLockState::default();
        let r = req("'JOHN.PDS'");
        let aux = match parse(&mut lock, &raw, &r, &LogFacadeSink).unwrap() {
            ListingStep::Auxiliary(a) => a,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(aux.command, "XDSS 'JOHN.PDS'");

        let mut reply = Reply::new("200", "end");
        reply.info_lines = vec!["200-DSORG=PO RECFM=FB LRECL=80 BLKSIZE=27920".to_string()];
        supply_auxiliary(&mut lock, &aux, Some(&reply));
        let p = done(parse(&mut lock, &raw, &r, &LogFacadeSink));
        assert_eq!(p.entries.len(), 1);
        assert_eq!(p.entries[0].size, 25 * 80);
        assert_eq!(p.entries[0].full_path, "'JOHN.PDS(MEMBER1)'");

        // A rejected XDSS is recorded so the listing still completes.
        let mut lock = ParserLockState::default();
        let _ = parse(&mut lock, &raw, &r, &LogFacadeSink).unwrap();
        supply_auxiliary(&mut lock, &aux, None);
        let p = done(parse(&mut lock, &raw, &r, &LogFacadeSink));
        assert_eq!(p.entries[0].size, ListEntry::UNKNOWN_SIZE);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(normalize_path("/a/./b//c/"), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "/abs"), "/abs");
        assert_eq!(resolve_header("/pub", "./sub/deeper"), "/pub/sub/deeper");
        assert_eq!(resolve_header("/pub", "/other"), "/other");
    }
}
