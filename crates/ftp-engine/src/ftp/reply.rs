//! Reply codec (RFC 959 §4.2).
//!
//! A final reply line has the shape `<3 digits><space><message>`. Anything
//! received before it is an informational line and is kept, in order, in
//! the reply's `info_lines`:
//!
//! ```text
//! 211-Features:
//!  MLSD
//!  SIZE
//! 211 End
//! ```

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{CapabilitySet, Reply};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FINAL_LINE: Regex = Regex::new(r"^(\d{3})(?: (.*))?$").unwrap();
    static ref OPENING_LINE: Regex = Regex::new(r"^(\d{3})-").unwrap();
}

/// Code and message of a final reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFragment {
    pub code: String,
    pub message: String,
}

/// Decode one line. `None` means the line is informational.
pub fn decode(line: &str) -> Option<ReplyFragment> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = FINAL_LINE.captures(line)?;
    Some(ReplyFragment {
        code: caps[1].to_string(),
        message: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

/// Collects lines until a final reply line completes a [`Reply`].
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    info: Vec<String>,
    /// Code of a `NNN-` opener; only `NNN ` may close that block.
    opening_code: Option<String>,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line. Returns the reply once its final line arrives.
    pub fn feed(&mut self, line: &str) -> Option<Reply> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(frag) = decode(line) {
            let closes = match &self.opening_code {
                Some(open) => *open == frag.code,
                None => true,
            };
            if closes {
                self.opening_code = None;
                return Some(Reply {
                    code: frag.code,
                    message: frag.message,
                    info_lines: std::mem::take(&mut self.info),
                    originating_command: String::new(),
                });
            }
        }

        if self.info.is_empty() {
            if let Some(caps) = OPENING_LINE.captures(line) {
                self.opening_code = Some(caps[1].to_string());
            }
        }
        self.info.push(line.to_string());
        None
    }

    pub fn has_partial(&self) -> bool {
        !self.info.is_empty()
    }

    pub fn reset(&mut self) {
        self.info.clear();
        self.opening_code = None;
    }
}

// ─── Reply interpretation helpers ────────────────────────────────────

/// Parse `257 "/some/path" is current directory` into the path, with
/// doubled quotes unescaped.
pub fn parse_pwd(reply: &Reply) -> FtpResult<String> {
    let text = &reply.message;
    if let Some(start) = text.find('"') {
        let rest = &text[start + 1..];
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    out.push('"');
                    chars.next();
                    continue;
                }
                return Ok(out);
            }
            out.push(c);
        }
    }
    // Some servers reply `257 /path`.
    let bare = text.split_whitespace().next().unwrap_or("");
    if bare.starts_with('/') {
        return Ok(bare.to_string());
    }
    Err(FtpError::protocol_error(format!("Cannot parse PWD: {}", reply)))
}

/// Build the capability set from a FEAT reply. The `211-` opener is not a
/// feature.
pub fn parse_feat(reply: &Reply) -> CapabilitySet {
    CapabilitySet::from_feat_lines(
        reply
            .info_lines
            .iter()
            .filter(|l| !OPENING_LINE.is_match(l))
            .map(|l| l.as_str()),
    )
}

/// `213 12345` → 12345.
pub fn parse_size(reply: &Reply) -> FtpResult<i64> {
    reply
        .message
        .trim()
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse SIZE: {}", reply)))
}

/// `213 20260101120000[.sss]` → UTC timestamp.
pub fn parse_mdtm(reply: &Reply) -> FtpResult<DateTime<Utc>> {
    let raw = reply.message.trim().split_whitespace().next().unwrap_or("");
    parse_machine_time(raw)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse MDTM: {}", reply)))
}

/// RFC 3659 time-val: `YYYYMMDDHHMMSS[.sss]`, always UTC.
pub fn parse_machine_time(s: &str) -> Option<DateTime<Utc>> {
    let base = s.split('.').next()?;
    if base.len() < 14 {
        return None;
    }
    NaiveDateTime::parse_from_str(&base[..14], "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Extract the fact line from an MLST reply:
///
/// ```text
/// 250-Listing /foo
///  type=file;size=1234;modify=20260101120000; /foo
/// 250 End
/// ```
pub fn mlst_fact_line(reply: &Reply) -> FtpResult<String> {
    reply
        .info_lines
        .iter()
        .find(|l| !OPENING_LINE.is_match(l) && l.contains('=') && l.contains(';'))
        .map(|l| l.trim_start().to_string())
        .ok_or_else(|| FtpError::protocol_error("MLST: no fact line in reply"))
}
