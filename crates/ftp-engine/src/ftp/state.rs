//! Per-session mutable state.
//!
//! Everything here lives behind the session's command lock. The foreground
//! path and the daemons only ever touch it while holding that lock.

use crate::ftp::listing::{join_path, normalize_path, ParserLockState};
use crate::ftp::types::{CapabilitySet, DataType, ServerOs, ServerSoftware};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct SessionState {
    /// Populated by FEAT on the first connection. Replaced wholesale, never
    /// mutated, so handles given out stay valid.
    pub capabilities: Arc<CapabilitySet>,
    /// TYPE currently in effect on the server.
    pub current_data_type: DataType,
    /// Cached PWD result; any directory change invalidates it.
    pub last_working_directory: Option<String>,
    /// Directory restored after a reconnect.
    pub restore_directory: Option<String>,
    pub authenticated: bool,
    pub last_command_time: Instant,
    /// A multi-command exchange is running that must not be split by a
    /// reconnect (e.g. a listing plus its auxiliary query).
    pub in_critical_sequence: bool,

    // ── Data transfer / keep-alive bookkeeping ───────────────────
    /// A data connection is open and its final reply is still owed.
    pub transfer_open: bool,
    /// Keep-alive commands sent during a transfer whose replies were not
    /// read.
    pub pending_keepalive_replies: u32,
    pub keepalive_disabled: bool,
    /// The control socket is known bad; the next command reconnects first.
    pub needs_reconnect: bool,

    // ── Server identification ────────────────────────────────────
    pub banner: Option<String>,
    pub system_type: Option<String>,
    pub server_os: ServerOs,
    pub server_software: ServerSoftware,

    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    /// Listing dialect lock, kept across listings.
    pub parser_lock: ParserLockState,
}

impl SessionState {
    pub fn new(data_type: DataType) -> Self {
        Self {
            capabilities: Arc::new(CapabilitySet::new()),
            current_data_type: data_type,
            last_working_directory: None,
            restore_directory: None,
            authenticated: false,
            last_command_time: Instant::now(),
            in_critical_sequence: false,
            transfer_open: false,
            pending_keepalive_replies: 0,
            keepalive_disabled: false,
            needs_reconnect: false,
            banner: None,
            system_type: None,
            server_os: ServerOs::Unknown,
            server_software: ServerSoftware::Unknown,
            connected_at: None,
            reconnect_count: 0,
            parser_lock: ParserLockState::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_command_time = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_command_time.elapsed()
    }

    /// A command that may change the working directory succeeded; `None`
    /// is CDUP. Relative targets are resolved against the last known
    /// directory. Returns `false` when the new directory could not be
    /// worked out locally, in which case `restore_directory` is cleared
    /// until a PWD reports it.
    pub fn directory_changed(&mut self, target: Option<&str>) -> bool {
        let base = self
            .last_working_directory
            .take()
            .or_else(|| self.restore_directory.clone());
        let target = target.unwrap_or("..");
        let resolved = if target.starts_with('/') {
            Some(normalize_path(target))
        } else {
            base.filter(|b| b.starts_with('/'))
                .map(|b| normalize_path(&join_path(&b, target)))
        };
        let known = resolved.is_some();
        self.restore_directory = resolved;
        known
    }

    pub fn directory_known(&mut self, path: &str) {
        self.last_working_directory = Some(path.to_string());
        self.restore_directory = Some(path.to_string());
    }

    /// Forget everything tied to the old control connection. Capabilities
    /// and the listing lock survive: they describe the server, not the
    /// socket.
    pub fn connection_lost(&mut self) {
        self.authenticated = false;
        self.transfer_open = false;
        self.pending_keepalive_replies = 0;
        self.last_working_directory = None;
    }
}
