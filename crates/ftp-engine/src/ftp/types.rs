//! Shared types for the FTP session engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::ftp::config::FtpSecurityMode;
use crate::ftp::listing::ListingFormat;

// ─── Reply ───────────────────────────────────────────────────────────

/// A complete FTP reply. Immutable once produced by the reply reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Three-digit reply code, kept as text exactly as received.
    pub code: String,
    /// Text after `<code><space>` on the final line.
    pub message: String,
    /// Lines received before the final line, in order.
    pub info_lines: Vec<String>,
    /// Command that produced this reply, credentials masked.
    pub originating_command: String,
}

impl Reply {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            info_lines: Vec::new(),
            originating_command: String::new(),
        }
    }

    /// A reply the engine fabricates without touching the wire.
    pub fn synthetic(code: &str, message: &str, command: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            info_lines: Vec::new(),
            originating_command: command.to_string(),
        }
    }

    /// Success means the first digit is 1, 2 or 3.
    pub fn is_success(&self) -> bool {
        matches!(self.code.as_bytes().first(), Some(b'1' | b'2' | b'3'))
    }

    pub fn is_preliminary(&self) -> bool {
        self.code.starts_with('1')
    }

    pub fn is_completion(&self) -> bool {
        self.code.starts_with('2')
    }

    /// Numeric value of the code (0 if it is somehow not numeric).
    pub fn numeric_code(&self) -> u16 {
        self.code.parse().unwrap_or(0)
    }

    /// Info lines joined with `\n`.
    pub fn info_text(&self) -> String {
        self.info_lines.join("\n")
    }

    /// Info lines followed by the final message.
    pub fn text(&self) -> String {
        if self.info_lines.is_empty() {
            self.message.clone()
        } else {
            format!("{}\n{}", self.info_text(), self.message)
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

// ─── Server Capabilities ─────────────────────────────────────────────

/// A feature a server can advertise in its FEAT reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Mlsd,
    Mlst,
    Size,
    Mdtm,
    Mfmt,
    RestStream,
    Utf8,
    Epsv,
    Eprt,
    AuthTls,
    Pbsz,
    Prot,
    Tvfs,
    Clnt,
    Hash,
    Md5,
    Xmd5,
    Xcrc,
    Xsha1,
    Xsha256,
    Xsha512,
    Pret,
    ModeZ,
    Lang,
    SiteMkdir,
    SiteSymlink,
}

impl Capability {
    /// Map one (already trimmed) FEAT line to a capability.
    pub fn from_feat_line(line: &str) -> Option<Self> {
        let upper = line.trim().to_uppercase();
        let token = upper.split_whitespace().next()?;
        let cap = match token {
            "MLSD" => Self::Mlsd,
            // MLSD is advertised on its own line.
            "MLST" => Self::Mlst,
            "SIZE" => Self::Size,
            "MDTM" => Self::Mdtm,
            "MFMT" => Self::Mfmt,
            "REST" if upper.contains("STREAM") => Self::RestStream,
            "UTF8" => Self::Utf8,
            "EPSV" => Self::Epsv,
            "EPRT" => Self::Eprt,
            "AUTH" if upper.contains("TLS") => Self::AuthTls,
            "PBSZ" => Self::Pbsz,
            "PROT" => Self::Prot,
            "TVFS" => Self::Tvfs,
            "CLNT" => Self::Clnt,
            "HASH" => Self::Hash,
            "MD5" | "MMD5" => Self::Md5,
            "XMD5" => Self::Xmd5,
            "XCRC" => Self::Xcrc,
            "XSHA" | "XSHA1" => Self::Xsha1,
            "XSHA256" => Self::Xsha256,
            "XSHA512" => Self::Xsha512,
            "PRET" => Self::Pret,
            "MODE" if upper.contains(" Z") => Self::ModeZ,
            "LANG" => Self::Lang,
            "SITE" if upper.contains("MKDIR") => Self::SiteMkdir,
            "SITE" if upper.contains("SYMLINK") => Self::SiteSymlink,
            _ => return None,
        };
        Some(cap)
    }
}

/// The set of features a server advertised. Populated once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    caps: BTreeSet<Capability>,
    /// FEAT body lines, upper-cased and trimmed.
    pub raw_features: Vec<String>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from the lines of a FEAT body.
    pub fn from_feat_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = Self::default();
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            set.raw_features.push(trimmed.to_uppercase());
            if let Some(cap) = Capability::from_feat_line(trimmed) {
                set.caps.insert(cap);
            }
        }
        set
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    pub fn insert(&mut self, cap: Capability) {
        self.caps.insert(cap);
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty() && self.raw_features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            caps: iter.into_iter().collect(),
            raw_features: Vec::new(),
        }
    }
}

// ─── Server identification ───────────────────────────────────────────

/// Operating system family, from the SYST reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ServerOs {
    Unix,
    Windows,
    Vms,
    IbmOs400,
    IbmZos,
    NonStop,
    #[default]
    Unknown,
}

impl ServerOs {
    pub fn from_syst(text: &str) -> Self {
        let upper = text.to_uppercase();
        if upper.contains("UNIX") || upper.contains("LINUX") || upper.contains("MACOS") {
            Self::Unix
        } else if upper.contains("WINDOWS") {
            Self::Windows
        } else if upper.contains("OS/400") || upper.contains("OS400") {
            Self::IbmOs400
        } else if upper.contains("MVS") || upper.contains("Z/OS") || upper.contains("OS/390") {
            Self::IbmZos
        } else if upper.contains("VMS") {
            Self::Vms
        } else if upper.contains("NONSTOP") || upper.contains("TANDEM") || upper.contains("GUARDIAN") {
            Self::NonStop
        } else {
            Self::Unknown
        }
    }

    /// Listing dialect to try first for this OS.
    pub fn preferred_listing(&self) -> Option<ListingFormat> {
        match self {
            Self::Unix => Some(ListingFormat::Unix),
            Self::Windows => Some(ListingFormat::Windows),
            Self::Vms => Some(ListingFormat::Vms),
            Self::IbmOs400 => Some(ListingFormat::IbmOs400),
            Self::IbmZos => Some(ListingFormat::IbmZos),
            Self::NonStop => Some(ListingFormat::NonStop),
            Self::Unknown => None,
        }
    }
}

/// Server software, from the welcome banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ServerSoftware {
    ProFtpd,
    PureFtpd,
    VsFtpd,
    FileZilla,
    Iis,
    ServU,
    GlFtpd,
    WsFtp,
    #[default]
    Unknown,
}

impl ServerSoftware {
    pub fn from_banner(banner: &str) -> Self {
        let lower = banner.to_lowercase();
        if lower.contains("proftpd") {
            Self::ProFtpd
        } else if lower.contains("pure-ftpd") || lower.contains("pureftpd") {
            Self::PureFtpd
        } else if lower.contains("vsftpd") || lower.contains("(vsftpd") {
            Self::VsFtpd
        } else if lower.contains("filezilla") {
            Self::FileZilla
        } else if lower.contains("microsoft ftp") {
            Self::Iis
        } else if lower.contains("serv-u") {
            Self::ServU
        } else if lower.contains("glftpd") {
            Self::GlFtpd
        } else if lower.contains("ws_ftp") {
            Self::WsFtp
        } else {
            Self::Unknown
        }
    }

    /// Whether `LIST -R` is known to produce a usable recursive listing.
    pub fn supports_recursive_list(&self) -> bool {
        matches!(
            self,
            Self::ProFtpd | Self::PureFtpd | Self::GlFtpd | Self::ServU
        )
    }
}

// ─── Data channel ────────────────────────────────────────────────────

/// Representation type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Ascii,
    #[default]
    Binary,
}

impl DataType {
    pub fn type_command(&self) -> &'static str {
        match self {
            Self::Ascii => "TYPE A",
            Self::Binary => "TYPE I",
        }
    }

    /// Recognise `TYPE A` / `TYPE I` (and `TYPE L 8`) commands.
    pub fn from_type_command(cmd: &str) -> Option<Self> {
        let upper = cmd.trim().to_uppercase();
        let arg = upper.strip_prefix("TYPE")?.trim();
        match arg.chars().next()? {
            'A' => Some(Self::Ascii),
            'I' | 'L' => Some(Self::Binary),
            _ => None,
        }
    }
}

/// How the data connection is negotiated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataConnectionMode {
    /// EPSV when advertised, PASV otherwise.
    #[default]
    AutoPassive,
    Passive,
    ExtendedPassive,
    /// EPRT when advertised, PORT otherwise.
    AutoActive,
    Active,
    ExtendedActive,
}

/// Direction of the bytes on the data connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Where a data connection goes. Created per transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConnectionDescriptor {
    pub mode: DataConnectionMode,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_bind_port: Option<u16>,
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Link,
    Unknown,
}

/// Position of an entry relative to the listed directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum EntrySubtype {
    /// `.` or the listed directory itself (MLSD `cdir`).
    SelfDir,
    /// `..` (MLSD `pdir`).
    ParentDir,
    /// An ordinary sub-directory.
    SubDir,
    #[default]
    None,
}

/// Permissions as printed by the server plus a decoded Unix mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPermissions {
    pub raw: String,
    pub mode: Option<u32>,
}

impl EntryPermissions {
    /// Decode an `ls -l` style string (`drwxr-sr-t`), first char optional.
    pub fn from_unix(raw: &str) -> Self {
        let bits: Vec<char> = raw.chars().collect();
        let perms = if bits.len() == 10 { &bits[1..] } else { &bits[..] };
        let mode = if perms.len() == 9 {
            let mut mode = 0u32;
            for (i, c) in perms.iter().enumerate() {
                let shift = 8 - i as u32;
                match c {
                    'r' | 'w' | 'x' => mode |= 1 << shift,
                    's' => mode |= 1 << shift | if i == 2 { 0o4000 } else { 0o2000 },
                    'S' => mode |= if i == 2 { 0o4000 } else { 0o2000 },
                    't' => mode |= 1 << shift | 0o1000,
                    'T' => mode |= 0o1000,
                    _ => {}
                }
            }
            Some(mode)
        } else {
            None
        };
        Self {
            raw: raw.to_string(),
            mode,
        }
    }

    /// Decode an octal string such as `0755` (MLSD `unix.mode`).
    pub fn from_octal(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            mode: u32::from_str_radix(raw.trim(), 8).ok(),
        }
    }
}

/// One entry from a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub name: String,
    /// Absolute path, resolved once the containing directory is known.
    pub full_path: String,
    pub kind: EntryKind,
    pub subtype: EntrySubtype,
    /// Size in bytes, [`ListEntry::UNKNOWN_SIZE`] when the dialect has none.
    pub size: i64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub permissions: Option<EntryPermissions>,
    pub link_target: Option<String>,
    /// Raw line(s) from the server.
    pub raw: String,
    /// MLSD fact map (lower-cased keys).
    #[serde(default)]
    pub facts: HashMap<String, String>,
}

impl ListEntry {
    pub const UNKNOWN_SIZE: i64 = -1;

    pub fn new(name: impl Into<String>, kind: EntryKind, raw: &str) -> Self {
        Self {
            name: name.into(),
            full_path: String::new(),
            kind,
            subtype: EntrySubtype::None,
            size: Self::UNKNOWN_SIZE,
            modified: None,
            created: None,
            owner: None,
            group: None,
            permissions: None,
            link_target: None,
            raw: raw.to_string(),
            facts: HashMap::new(),
        }
    }

    pub fn is_self_or_parent(&self) -> bool {
        matches!(self.subtype, EntrySubtype::SelfDir | EntrySubtype::ParentDir)
    }
}

/// Whether to use MLSD instead of LIST.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MachineListing {
    /// MLSD when the server advertises it.
    #[default]
    Auto,
    Always,
    Never,
}

fn default_true() -> bool {
    true
}

/// Options for a listing request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Ask the server for a recursive listing (`LIST -R`).
    #[serde(default)]
    pub recursive: bool,
    /// Keep `.`/`..` and the listed directory itself.
    #[serde(default)]
    pub include_self_and_parent: bool,
    /// Skip detection and parse with this dialect.
    #[serde(default)]
    pub force_parser: Option<ListingFormat>,
    #[serde(default)]
    pub machine_listing: MachineListing,
    /// Pass `-a` on Unix servers so dot-files are listed.
    #[serde(default = "default_true")]
    pub hidden_files: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            include_self_and_parent: false,
            force_parser: None,
            machine_listing: MachineListing::Auto,
            hidden_files: true,
        }
    }
}

/// Result of a listing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpListing {
    pub path: String,
    pub entries: Vec<ListEntry>,
    /// Recursion was requested but the server cannot do it; the caller has
    /// to walk sub-directories itself.
    pub manual_recursion_required: bool,
    /// Dialect the entries were parsed with.
    pub parser: Option<ListingFormat>,
}

// ─── Session ─────────────────────────────────────────────────────────

/// Snapshot of a session for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub security: FtpSecurityMode,
    pub connected: bool,
    pub authenticated: bool,
    pub ephemeral: bool,
    pub current_directory: Option<String>,
    pub server_banner: Option<String>,
    pub system_type: Option<String>,
    pub server_os: ServerOs,
    pub server_software: ServerSoftware,
    pub capabilities: Vec<Capability>,
    pub data_type: DataType,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub label: Option<String>,
}
