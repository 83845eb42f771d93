//! Command executor.
//!
//! Every command on the control connection goes through here, under the
//! session's command lock. Before sending it makes sure the channel is
//! usable (connected, TLS session not over its line budget, no stale
//! bytes); afterwards it records what the command changed. A dropped
//! connection gets one reconnect and one retry of the command.

use crate::ftp::config::FtpConnectionConfig;
use crate::ftp::connection::{self, ConnectContext};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::liveness::DataSocketWatch;
use crate::ftp::logger::{mask_command, FtpLogSink, SharedLogSink};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::reader::ReplyReader;
use crate::ftp::reply::parse_pwd;
use crate::ftp::state::SessionState;
use crate::ftp::types::{DataType, Reply};
use log::Level;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

/// Upper bound on closing a control socket that may already be dead.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// The control connection and the state guarded with it.
pub struct ControlChannel {
    pub codec: Option<FtpCodec>,
    pub state: SessionState,
}

impl ControlChannel {
    pub fn is_connected(&self) -> bool {
        self.codec.is_some() && !self.state.needs_reconnect
    }
}

/// Session core shared by the engine handle, its data streams and its
/// daemons.
pub struct SessionShared {
    pub id: String,
    pub config: FtpConnectionConfig,
    pub sink: SharedLogSink,
    pub tls: Option<TlsConnector>,
    pub ephemeral: bool,
    /// The command lock.
    pub control: Mutex<ControlChannel>,
    /// Open data socket, for the liveness daemon.
    pub data_watch: StdMutex<Option<DataSocketWatch>>,
}

impl SessionShared {
    pub fn log(&self, level: Level, message: &str) {
        self.sink.log(level, message);
    }

    pub fn sink(&self) -> &dyn FtpLogSink {
        &*self.sink
    }

    pub fn clear_data_watch(&self) {
        if let Ok(mut watch) = self.data_watch.lock() {
            *watch = None;
        }
    }

    /// Bare session core around an already connected codec.
    #[cfg(test)]
    pub(crate) fn for_tests(config: FtpConnectionConfig, codec: Option<FtpCodec>) -> Self {
        let state = SessionState::new(config.data_type);
        Self {
            id: "test".to_string(),
            config,
            sink: crate::ftp::logger::default_sink(),
            tls: None,
            ephemeral: false,
            control: Mutex::new(ControlChannel { codec, state }),
            data_watch: StdMutex::new(None),
        }
    }
}

/// Runs commands on behalf of one session.
pub struct CommandExecutor<'s> {
    shared: &'s SessionShared,
}

impl<'s> CommandExecutor<'s> {
    pub fn new(shared: &'s SessionShared) -> Self {
        Self { shared }
    }

    /// Take the command lock and run `cmd`.
    pub async fn execute(&self, cmd: &str) -> FtpResult<Reply> {
        let mut chan = self.shared.control.lock().await;
        self.execute_locked(&mut chan, cmd).await
    }

    /// Run `cmd` with the command lock already held by the caller.
    pub async fn execute_locked(&self, chan: &mut ControlChannel, cmd: &str) -> FtpResult<Reply> {
        let config = &self.shared.config;
        let masked = mask_command(cmd, config.mask_username);
        let verb = cmd
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase();

        // The next reply on the wire belongs to the open transfer.
        if chan.state.transfer_open {
            return Err(FtpError::data_channel(format!(
                "Cannot send {}: a data transfer is open on this session; finish it first",
                masked
            ))
            .with_session(&self.shared.id));
        }

        // ── Connection precondition ──────────────────────────────
        if !chan.is_connected() {
            if verb == "QUIT" {
                return Ok(Reply::synthetic("221", "Not connected", &masked));
            }
            if chan.state.in_critical_sequence {
                return Err(FtpError::disconnected(format!(
                    "Cannot send {}: control connection lost during data negotiation",
                    masked
                ))
                .with_session(&self.shared.id));
            }
            self.reconnect(chan, "not connected").await.map_err(|e| {
                let code = e.code;
                let mut err = FtpError::not_connected(format!(
                    "Cannot send {}: reconnect failed: {}",
                    masked, e.message
                ));
                err.code = code;
                err.with_session(&self.shared.id)
            })?;
        }

        // ── TLS session budget ───────────────────────────────────
        let limit = config.tls_renegotiate_after_lines;
        let over_budget = chan
            .codec
            .as_ref()
            .map(|c| c.is_tls() && limit > 0 && c.lines_read() >= limit)
            .unwrap_or(false);
        if over_budget && verb != "QUIT" && !chan.state.in_critical_sequence {
            self.reconnect(chan, "TLS session line limit reached").await?;
        }

        // ── Stale data ───────────────────────────────────────────
        if config.stale_data_check && !chan.state.in_critical_sequence {
            self.discard_stale(chan).await?;
        }

        // ── Send + collect, one retry on a dropped connection ────
        let reply = match self.attempt(chan, cmd).await {
            Ok(reply) => reply,
            Err(e) if verb == "QUIT" && e.is_transient() => {
                return Ok(Reply::synthetic("221", "Connection already closed", &masked));
            }
            // PRET/PASV/LIST and friends are not resent one by one.
            Err(e) if chan.state.in_critical_sequence => return Err(e.with_session(&self.shared.id)),
            Err(e) if e.is_transient() => {
                self.shared.log(
                    Level::Warn,
                    &format!("{} failed ({}); reconnecting and retrying once", masked, e),
                );
                self.reconnect(chan, "connection lost").await?;
                self.attempt(chan, cmd).await?
            }
            Err(e) => return Err(e.with_session(&self.shared.id)),
        };

        // ── State updates ────────────────────────────────────────
        chan.state.touch();
        if reply.is_success() {
            let arg = cmd.trim().get(verb.len()..).unwrap_or("").trim();
            match verb.as_str() {
                "CWD" | "XCWD" | "CDUP" | "XCUP" => {
                    let target = verb.ends_with("CWD").then_some(arg);
                    if !chan.state.directory_changed(target) {
                        self.refresh_directory(chan).await;
                    }
                }
                "PWD" | "XPWD" => {
                    if let Ok(path) = parse_pwd(&reply) {
                        chan.state.directory_known(&path);
                    }
                }
                "TYPE" => {
                    if let Some(t) = DataType::from_type_command(cmd) {
                        chan.state.current_data_type = t;
                    }
                }
                "QUIT" => self.drop_connection(chan).await,
                _ => {}
            }
        }
        Ok(reply)
    }

    /// One send/collect round. A connection that times out or drops is
    /// presumed dead and released.
    async fn attempt(&self, chan: &mut ControlChannel, cmd: &str) -> FtpResult<Reply> {
        let codec = chan
            .codec
            .as_mut()
            .ok_or_else(|| FtpError::not_connected("No control connection"))?;
        let result = ReplyReader::new(codec, self.shared.sink(), self.shared.config.mask_username)
            .exchange(cmd, self.shared.config.read_timeout())
            .await;
        if let Err(e) = &result {
            if e.is_transient() || e.kind == FtpErrorKind::Timeout {
                self.drop_connection(chan).await;
            }
        }
        result
    }

    /// Ask the server where a directory change landed.
    async fn refresh_directory(&self, chan: &mut ControlChannel) {
        match self.attempt(chan, "PWD").await {
            Ok(reply) if reply.is_completion() => {
                if let Ok(path) = parse_pwd(&reply) {
                    chan.state.directory_known(&path);
                }
            }
            Ok(reply) => self
                .shared
                .log(Level::Debug, &format!("PWD after directory change refused: {}", reply)),
            Err(e) => self
                .shared
                .log(Level::Debug, &format!("PWD after directory change failed: {}", e)),
        }
    }

    /// Reconnect if unread bytes are waiting on the control connection or
    /// it turns out to be closed.
    pub async fn discard_stale(&self, chan: &mut ControlChannel) -> FtpResult<()> {
        let stale = match chan.codec.as_mut() {
            Some(codec) => codec.drain_stale().await,
            None => return Ok(()),
        };
        match stale {
            Ok(lines) if lines.is_empty() => Ok(()),
            Ok(lines) => {
                self.shared.log(
                    Level::Warn,
                    &format!("Stale data on control connection: {}", lines.join(" | ")),
                );
                self.reconnect(chan, "stale data on control connection").await
            }
            Err(e) => {
                self.shared
                    .log(Level::Debug, &format!("Control connection check failed: {}", e));
                self.reconnect(chan, "control connection lost").await
            }
        }
    }

    /// Connect if there is no usable control connection.
    pub async fn ensure_connected(&self, chan: &mut ControlChannel) -> FtpResult<()> {
        if chan.is_connected() {
            return Ok(());
        }
        self.reconnect(chan, "not connected").await
    }

    /// Replace the control connection with a fresh, fully handshaken one.
    pub async fn reconnect(&self, chan: &mut ControlChannel, reason: &str) -> FtpResult<()> {
        let config = &self.shared.config;
        let was_connected = chan.state.connected_at.is_some();
        self.drop_connection(chan).await;
        self.shared.log(
            Level::Info,
            &format!("Connecting to {}:{} ({})", config.host, config.port, reason),
        );

        let ctx = ConnectContext {
            config,
            tls: self.shared.tls.as_ref(),
            sink: self.shared.sink(),
        };
        match connection::establish(&ctx, &mut chan.state).await {
            Ok(codec) => {
                chan.codec = Some(codec);
                if was_connected {
                    chan.state.reconnect_count += 1;
                }
                Ok(())
            }
            Err(e) => {
                self.shared
                    .log(Level::Warn, &format!("Connection to {} failed: {}", config.host, e));
                chan.state.connection_lost();
                Err(e.with_session(&self.shared.id))
            }
        }
    }

    /// Close the control socket (best effort) and forget it.
    pub async fn drop_connection(&self, chan: &mut ControlChannel) {
        if let Some(mut codec) = chan.codec.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, codec.shutdown()).await;
        }
        chan.state.connection_lost();
        chan.state.needs_reconnect = false;
    }
}
