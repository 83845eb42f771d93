//! Listing detection through the public engine API.

use chrono::{TimeZone, Utc};
use ftp_engine::ftp::listing::{self, ListingRequest, ListingStep, ParsedListing, ParserLockState};
use ftp_engine::ftp::{EntryKind, FtpErrorKind, FtpLogSink, ListingFormat};
use log::Level;
use std::sync::Mutex;

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<(Level, String)>>,
}

impl FtpLogSink for RecordingSink {
    fn log(&self, level: Level, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }
}

impl RecordingSink {
    fn warnings(&self) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == Level::Warn)
            .count()
    }
}

fn request(path: &str) -> ListingRequest<'_> {
    ListingRequest {
        path,
        recursive: false,
        include_self_and_parent: false,
        forced: None,
        preferred: None,
        vms_strip_version: true,
    }
}

fn lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

fn done(step: ListingStep) -> ParsedListing {
    match step {
        ListingStep::Done(parsed) => parsed,
        ListingStep::Auxiliary(aux) => panic!("unexpected auxiliary command {}", aux.command),
    }
}

#[test]
fn windows_listing_is_detected_and_locked() {
    let sink = RecordingSink::default();
    let mut lock = ParserLockState::default();
    let raw = lines(
        "03-07-13  10:02AM                  901 File01.xml\n\
         03-07-13  10:03AM       <DIR>          Documents",
    );
    let parsed = done(listing::parse(&mut lock, &raw, &request("/share"), &sink).unwrap());

    assert_eq!(parsed.format, Some(ListingFormat::Windows));
    assert_eq!(parsed.entries.len(), 2);
    let file = &parsed.entries[0];
    assert_eq!(file.name, "File01.xml");
    assert_eq!(file.kind, EntryKind::File);
    assert_eq!(file.size, 901);
    assert_eq!(file.full_path, "/share/File01.xml");
    assert_eq!(parsed.entries[1].kind, EntryKind::Directory);

    assert_eq!(lock.format, Some(ListingFormat::Windows));
    assert!(lock.confirmed);
}

#[test]
fn vms_listing_uses_blocks_and_strips_versions() {
    let sink = RecordingSink::default();
    let mut lock = ParserLockState::default();
    let raw = lines(
        "Directory USER1:[TEST]\n\
         \n\
         TEL_4114.TXT;1 1178 21-MAR-2012 15:19 [TBMS,TBMS_BOSS] (RWED,RWED,,RE)\n\
         \n\
         Total of 1 file, 1178 blocks.",
    );
    let parsed = done(listing::parse(&mut lock, &raw, &request("USER1:[TEST]"), &sink).unwrap());

    assert_eq!(parsed.format, Some(ListingFormat::Vms));
    assert_eq!(parsed.entries.len(), 1);
    let e = &parsed.entries[0];
    assert_eq!(e.name, "TEL_4114.TXT");
    assert_eq!(e.size, 1178 * 512);
    assert_eq!(e.modified, Some(Utc.with_ymd_and_hms(2012, 3, 21, 15, 19, 0).unwrap()));
    assert_eq!(e.full_path, "USER1:[TEST]TEL_4114.TXT");
}

#[test]
fn nonstop_listing_skips_header() {
    let sink = RecordingSink::default();
    let mut lock = ParserLockState::default();
    let raw = lines(
        "File         Code             EOF  Last Modification    Owner  RWEP\n\
         ALIASES       101            4034  29-Jan-10 12:05:58  255,255 \"nnnn\"",
    );
    let parsed = done(listing::parse(&mut lock, &raw, &request("$DATA.USER"), &sink).unwrap());

    assert_eq!(parsed.format, Some(ListingFormat::NonStop));
    assert_eq!(parsed.entries.len(), 1);
    assert_eq!(parsed.entries[0].name, "ALIASES");
    assert_eq!(parsed.entries[0].size, 4034);
}

#[test]
fn bad_line_is_logged_and_skipped() {
    let sink = RecordingSink::default();
    let mut lock = ParserLockState::default();
    let raw = lines(
        "-rw-r--r-- 1 ftp ftp 10 Jan 01 2020 a.txt\n\
         this is not a listing line\n\
         -rw-r--r-- 1 ftp ftp 20 Jan 01 2020 b.txt",
    );
    let parsed = done(listing::parse(&mut lock, &raw, &request("/"), &sink).unwrap());

    let names: Vec<&str> = parsed.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
    assert_eq!(parsed.restarts, 0);
    assert_eq!(sink.warnings(), 1);
}

#[test]
fn unparseable_listing_is_a_format_error() {
    let sink = RecordingSink::default();
    let mut lock = ParserLockState::default();
    let raw = lines("garbage one\ngarbage two");
    let err = listing::parse(&mut lock, &raw, &request("/"), &sink).unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::ListingFormat);
    assert!(lock.format.is_none());
}

#[test]
fn self_and_parent_are_kept_on_request() {
    let sink = RecordingSink::default();
    let mut lock = ParserLockState::default();
    let raw = lines(
        "drwxr-xr-x 7 user1 user1 512 Sep 27 2011 .\n\
         drwxr-xr-x 3 user1 user1 512 Sep 27 2011 ..\n\
         -rw-r--r-- 1 user1 user1 64 Sep 27 2011 data.bin",
    );

    let filtered = done(listing::parse(&mut lock, &raw, &request("/home/user1"), &sink).unwrap());
    assert_eq!(filtered.entries.len(), 1);

    let req = ListingRequest {
        include_self_and_parent: true,
        ..request("/home/user1")
    };
    let all = done(listing::parse(&mut lock, &raw, &req, &sink).unwrap());
    assert_eq!(all.entries.len(), 3);
    assert_eq!(all.entries[0].name, ".");
    assert_eq!(all.entries[0].kind, EntryKind::Directory);
    assert_eq!(all.entries[0].size, 512);
}
