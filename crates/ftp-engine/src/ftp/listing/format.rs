//! The closed set of listing dialects and their per-line contract.

use crate::ftp::listing::{machine, nonstop, os400, unix, vms, windows, zos};
use crate::ftp::types::ListEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A directory listing dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListingFormat {
    /// RFC 3659 MLSD facts.
    Machine,
    Unix,
    Windows,
    Vms,
    IbmOs400,
    IbmZos,
    NonStop,
}

/// Order in which dialects are tried when nothing is known about the
/// server.
pub const DETECTION_ORDER: [ListingFormat; 7] = [
    ListingFormat::Machine,
    ListingFormat::Unix,
    ListingFormat::Windows,
    ListingFormat::Vms,
    ListingFormat::IbmOs400,
    ListingFormat::IbmZos,
    ListingFormat::NonStop,
];

/// Date field order seen in OS/400 listings. The same server has been seen
/// printing any of these depending on job settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Os400DateOrder {
    #[default]
    MonthDayYear,
    DayMonthYear,
    YearMonthDay,
}

/// Which kind of z/OS listing is being read; selected by header lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZosRealm {
    #[default]
    Unknown,
    /// Catalogued datasets (`Volume Unit ... Dsname`).
    Datasets,
    /// Members of a partitioned dataset (`Name VV.MM ...`).
    Members,
    /// Load-module members (`Name Size TTR ...`).
    LoadModules,
    /// z/OS UNIX file system, printed like `ls -l`.
    Unix,
}

/// Dialect settings that can change mid-listing. A change restarts the
/// parse from the first line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DialectState {
    pub os400_dates: Os400DateOrder,
    pub zos_realm: ZosRealm,
    /// Record length of the dataset whose members are being listed, keyed
    /// by that dataset.
    pub zos_record_length: Option<(String, u32)>,
}

/// What a dialect needs to know about the listing as a whole.
pub struct ParseContext<'a> {
    /// Directory the current lines belong to.
    pub directory: &'a str,
    pub dialect: &'a DialectState,
    pub vms_strip_version: bool,
    pub now: DateTime<Utc>,
}

/// Result of feeding one logical line to a dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Entry(ListEntry),
    /// Header, footer, summary: not an entry and not an error.
    Skip,
    /// The line does not fit this dialect.
    Invalid,
    /// The line shows the dialect settings are wrong; restart with these.
    Switch(DialectState),
}

impl ListingFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Machine => "MLSD",
            Self::Unix => "Unix",
            Self::Windows => "Windows",
            Self::Vms => "VMS",
            Self::IbmOs400 => "IBM OS/400",
            Self::IbmZos => "IBM z/OS",
            Self::NonStop => "HP NonStop",
        }
    }

    /// Whether the sample (first lines of the listing) is plausibly in
    /// this dialect.
    pub fn looks_like(&self, sample: &[&str]) -> bool {
        match self {
            Self::Machine => machine::looks_like(sample),
            Self::Unix => unix::looks_like(sample),
            Self::Windows => windows::looks_like(sample),
            Self::Vms => vms::looks_like(sample),
            Self::IbmOs400 => os400::looks_like(sample),
            Self::IbmZos => zos::looks_like(sample),
            Self::NonStop => nonstop::looks_like(sample),
        }
    }

    pub fn parse_line(&self, line: &str, ctx: &ParseContext<'_>) -> LineOutcome {
        match self {
            Self::Machine => machine::parse_line(line, ctx),
            Self::Unix => unix::parse_line(line, ctx),
            Self::Windows => windows::parse_line(line, ctx),
            Self::Vms => vms::parse_line(line, ctx),
            Self::IbmOs400 => os400::parse_line(line, ctx),
            Self::IbmZos => zos::parse_line(line, ctx),
            Self::NonStop => nonstop::parse_line(line, ctx),
        }
    }

    /// Whether an indented line continues the previous record. OS/400 and
    /// z/OS print indented lines that are records of their own.
    pub fn joins_continuations(&self) -> bool {
        !matches!(self, Self::IbmOs400 | Self::IbmZos | Self::Machine)
    }
}

/// Split into whitespace-separated tokens, keeping byte offsets so that a
/// trailing name can be cut out of the original line with its spaces.
pub(crate) fn tokens(line: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, i, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, line.len(), &line[s..]));
    }
    out
}

/// First lines that carry content, for `looks_like`.
pub(crate) fn content_lines<'a>(sample: &'a [&'a str]) -> impl Iterator<Item = &'a str> + 'a {
    sample.iter().copied().filter(|l| !l.trim().is_empty())
}
