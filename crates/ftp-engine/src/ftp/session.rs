//! Session engine: the handle collaborators hold.
//!
//! `SessionEngine` is a cheap clone over the shared session core. It owns
//! the two background daemons, runs listings end to end and derives
//! sibling sessions for parallel data transfers.

use crate::ftp::config::{FtpConnectionConfig, FtpSecurityMode};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::executor::{CommandExecutor, ControlChannel, SessionShared};
use crate::ftp::keepalive;
use crate::ftp::listing::{self, machine, LineOutcome, ListingFormat, ListingRequest, ListingStep, ParseContext};
use crate::ftp::liveness;
use crate::ftp::logger::{default_sink, SharedLogSink};
use crate::ftp::reader::expect_completion;
use crate::ftp::reply::{mlst_fact_line, parse_mdtm, parse_pwd, parse_size};
use crate::ftp::state::SessionState;
use crate::ftp::tls;
use crate::ftp::transfer::{self, DataStream};
use crate::ftp::types::{
    Capability, CapabilitySet, DataType, FtpListing, ListEntry, ListOptions, MachineListing, Reply, ServerOs,
    SessionInfo, TransferDirection,
};
use chrono::{DateTime, Utc};
use log::Level;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// Auxiliary commands a single listing may need.
const MAX_AUX_ROUNDS: usize = 2;
/// How long `disconnect` waits for a daemon to notice shutdown.
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const LISTING_CHUNK: usize = 16 * 1024;

struct Daemons {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// One FTP session.
#[derive(Clone)]
pub struct SessionEngine {
    shared: Arc<SessionShared>,
    daemons: Arc<StdMutex<Option<Daemons>>>,
}

impl SessionEngine {
    /// A disconnected session logging through the `log` facade.
    pub fn new(config: FtpConnectionConfig) -> FtpResult<Self> {
        Self::with_log_sink(config, default_sink())
    }

    pub fn with_log_sink(config: FtpConnectionConfig, sink: SharedLogSink) -> FtpResult<Self> {
        config.validate()?;
        let tls = match config.security {
            FtpSecurityMode::None => None,
            _ => Some(tls::build_tls_connector(config.accept_invalid_certs)?),
        };
        let state = SessionState::new(config.data_type);
        Ok(Self::from_parts(config, sink, tls, state, false))
    }

    fn from_parts(
        config: FtpConnectionConfig,
        sink: SharedLogSink,
        tls: Option<tokio_rustls::TlsConnector>,
        state: SessionState,
        ephemeral: bool,
    ) -> Self {
        let shared = SessionShared {
            id: Uuid::new_v4().to_string(),
            config,
            sink,
            tls,
            ephemeral,
            control: tokio::sync::Mutex::new(ControlChannel { codec: None, state }),
            data_watch: StdMutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            daemons: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.shared.config
    }

    pub fn is_ephemeral(&self) -> bool {
        self.shared.ephemeral
    }

    fn executor(&self) -> CommandExecutor<'_> {
        CommandExecutor::new(&self.shared)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Open the control connection, log in and start the daemons.
    pub async fn connect(&self) -> FtpResult<SessionInfo> {
        {
            let mut chan = self.shared.control.lock().await;
            self.executor().ensure_connected(&mut chan).await?;
        }
        self.start_daemons();
        Ok(self.session_info().await)
    }

    /// Stop the daemons, say QUIT and close the socket. Teardown errors
    /// are logged and swallowed.
    pub async fn disconnect(&self) -> FtpResult<()> {
        self.stop_daemons().await;
        let exec = self.executor();
        let mut chan = self.shared.control.lock().await;
        if chan.codec.is_some() {
            if let Err(e) = exec.execute_locked(&mut chan, "QUIT").await {
                self.shared.log(Level::Debug, &format!("QUIT failed: {}", e));
            }
        }
        exec.drop_connection(&mut chan).await;
        drop(chan);
        self.shared.clear_data_watch();
        self.shared
            .log(Level::Info, &format!("Session {} disconnected", self.shared.id));
        Ok(())
    }

    fn start_daemons(&self) {
        let Ok(mut slot) = self.daemons.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tick = self.shared.config.daemon_tick();
        let tasks = vec![
            keepalive::spawn(Arc::downgrade(&self.shared), tick, shutdown_rx.clone()),
            liveness::spawn(Arc::downgrade(&self.shared), tick, shutdown_rx),
        ];
        *slot = Some(Daemons { shutdown_tx, tasks });
    }

    async fn stop_daemons(&self) {
        let daemons = match self.daemons.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(d) = daemons {
            let _ = d.shutdown_tx.send(true);
            for task in d.tasks {
                let _ = timeout(DAEMON_STOP_TIMEOUT, task).await;
            }
        }
    }

    // ─── Commands ────────────────────────────────────────────────────

    /// Send one command and return its final reply, whatever the code.
    pub async fn execute(&self, cmd: &str) -> FtpResult<Reply> {
        self.executor().execute(cmd).await
    }

    /// Negotiate a data connection and start `command` on it.
    pub async fn open_data_connection(
        &self,
        direction: TransferDirection,
        data_type: DataType,
        command: &str,
    ) -> FtpResult<DataStream> {
        transfer::open(&self.shared, direction, data_type, command).await
    }

    /// Close `stream` and return the transfer's final reply.
    pub async fn finish_data_transfer(&self, stream: DataStream) -> FtpResult<Reply> {
        stream.finish().await
    }

    // ─── Capabilities ────────────────────────────────────────────────

    /// The server's FEAT set. Connects first if it was never read; after
    /// that the same set is returned until it is replaced.
    pub async fn get_capabilities(&self) -> FtpResult<Arc<CapabilitySet>> {
        let mut chan = self.shared.control.lock().await;
        if chan.state.capabilities.is_empty() && chan.codec.is_none() {
            self.executor().ensure_connected(&mut chan).await?;
        }
        Ok(chan.state.capabilities.clone())
    }

    /// Replace the capability set, e.g. for servers with a broken FEAT.
    pub async fn set_capabilities(&self, caps: CapabilitySet) {
        let mut chan = self.shared.control.lock().await;
        chan.state.capabilities = Arc::new(caps);
    }

    // ─── Working directory and type ──────────────────────────────────

    pub async fn get_working_directory(&self) -> FtpResult<String> {
        let mut chan = self.shared.control.lock().await;
        if chan.is_connected() {
            if let Some(cwd) = &chan.state.last_working_directory {
                return Ok(cwd.clone());
            }
        }
        let reply = expect_completion(self.executor().execute_locked(&mut chan, "PWD").await?)?;
        parse_pwd(&reply)
    }

    pub async fn set_working_directory(&self, path: &str) -> FtpResult<()> {
        expect_completion(self.execute(&format!("CWD {}", path)).await?)?;
        Ok(())
    }

    /// Switch the transfer type; no command is sent if it is already set.
    pub async fn set_data_type(&self, data_type: DataType) -> FtpResult<()> {
        let exec = self.executor();
        let mut chan = self.shared.control.lock().await;
        exec.ensure_connected(&mut chan).await?;
        if chan.state.current_data_type != data_type {
            expect_completion(exec.execute_locked(&mut chan, data_type.type_command()).await?)?;
        }
        Ok(())
    }

    // ─── Metadata ────────────────────────────────────────────────────

    pub async fn get_file_size(&self, path: &str) -> FtpResult<i64> {
        let reply = expect_completion(self.execute(&format!("SIZE {}", path)).await?)?;
        parse_size(&reply)
    }

    pub async fn get_modified_time(&self, path: &str) -> FtpResult<DateTime<Utc>> {
        let reply = expect_completion(self.execute(&format!("MDTM {}", path)).await?)?;
        parse_mdtm(&reply)
    }

    /// `MLST` facts for one path.
    pub async fn get_object_info(&self, path: &str) -> FtpResult<ListEntry> {
        let reply = expect_completion(self.execute(&format!("MLST {}", path)).await?)?;
        let line = mlst_fact_line(&reply)?;
        let dialect = listing::DialectState::default();
        let ctx = ParseContext {
            directory: path,
            dialect: &dialect,
            vms_strip_version: self.shared.config.vms_strip_version,
            now: Utc::now(),
        };
        match machine::parse_line(&line, &ctx) {
            LineOutcome::Entry(mut entry) => {
                entry.full_path = if entry.name.starts_with('/') {
                    entry.name.clone()
                } else {
                    path.to_string()
                };
                Ok(entry)
            }
            _ => Err(FtpError::protocol_error(format!("MLST: cannot parse {:?}", line))),
        }
    }

    // ─── Listings ────────────────────────────────────────────────────

    /// List `path` (the working directory when empty).
    pub async fn get_listing(&self, path: &str, options: &ListOptions) -> FtpResult<FtpListing> {
        let caps = self.get_capabilities().await?;
        let config = &self.shared.config;

        let (server_os, recursive_capable, preferred) = {
            let chan = self.shared.control.lock().await;
            let lock = &chan.state.parser_lock;
            let preferred = if lock.confirmed {
                None
            } else {
                chan.state.server_os.preferred_listing()
            };
            (
                chan.state.server_os,
                config
                    .recursive_list_supported
                    .unwrap_or_else(|| chan.state.server_software.supports_recursive_list()),
                preferred,
            )
        };

        let forced = options.force_parser.or(config.listing_parser);
        let use_mlsd = match forced {
            Some(f) => f == ListingFormat::Machine,
            None => match options.machine_listing {
                MachineListing::Always => true,
                MachineListing::Never => false,
                MachineListing::Auto => caps.has(Capability::Mlsd),
            },
        };
        let recursive = options.recursive && !use_mlsd && recursive_capable;
        let manual_recursion_required = options.recursive && !recursive;

        let listed = if path.is_empty() {
            self.get_working_directory().await?
        } else {
            path.to_string()
        };

        let command = if use_mlsd {
            with_argument("MLSD", path)
        } else {
            let mut flags = String::new();
            if options.hidden_files && matches!(server_os, ServerOs::Unix | ServerOs::Unknown) {
                flags.push('a');
            }
            if recursive {
                flags.push('R');
            }
            let verb = if flags.is_empty() {
                "LIST".to_string()
            } else {
                format!("LIST -{}", flags)
            };
            with_argument(&verb, path)
        };

        let raw = match self.read_listing(&command).await {
            Ok(raw) => raw,
            Err(e) if is_empty_directory_reply(&e) => {
                self.shared
                    .log(Level::Debug, &format!("{}: empty listing ({})", command, e.message));
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let req = ListingRequest {
            path: &listed,
            recursive,
            include_self_and_parent: options.include_self_and_parent,
            forced: if use_mlsd { Some(ListingFormat::Machine) } else { forced },
            preferred,
            vms_strip_version: config.vms_strip_version,
        };

        let exec = self.executor();
        let mut chan = self.shared.control.lock().await;
        for _ in 0..=MAX_AUX_ROUNDS {
            let step = listing::parse(&mut chan.state.parser_lock, &raw, &req, self.shared.sink())?;
            match step {
                ListingStep::Done(parsed) => {
                    self.shared.log(
                        Level::Debug,
                        &format!(
                            "{}: {} entries ({:?}, {} restarts)",
                            command,
                            parsed.entries.len(),
                            parsed.format,
                            parsed.restarts
                        ),
                    );
                    return Ok(FtpListing {
                        path: listed,
                        entries: parsed.entries,
                        manual_recursion_required,
                        parser: parsed.format,
                    });
                }
                ListingStep::Auxiliary(aux) => {
                    let reply = match exec.execute_locked(&mut chan, &aux.command).await {
                        Ok(r) => Some(r),
                        Err(e) => {
                            self.shared
                                .log(Level::Warn, &format!("{} failed: {}", aux.command, e));
                            None
                        }
                    };
                    listing::supply_auxiliary(&mut chan.state.parser_lock, &aux, reply.as_ref());
                }
            }
        }
        Err(FtpError::listing_format(format!(
            "{}: listing still needs server information after {} auxiliary commands",
            command, MAX_AUX_ROUNDS
        )))
    }

    /// Run a listing command over a data connection and split the body
    /// into lines.
    async fn read_listing(&self, command: &str) -> FtpResult<Vec<String>> {
        let data_type = self.shared.config.listing_data_type;
        let mut stream = self
            .open_data_connection(TransferDirection::Download, data_type, command)
            .await?;

        let read_timeout = self.shared.config.data_timeout();
        let mut body = Vec::new();
        let mut chunk = vec![0u8; LISTING_CHUNK];
        loop {
            let n = match timeout(read_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(FtpError::transfer_failed(format!("{}: {}", command, e))),
                Err(_) => return Err(FtpError::timeout(format!("{}: data connection stalled", command))),
            };
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        expect_completion(stream.finish().await?)?;

        let text = String::from_utf8_lossy(&body);
        Ok(text
            .split('\n')
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    // ─── Introspection ───────────────────────────────────────────────

    pub async fn session_info(&self) -> SessionInfo {
        let chan = self.shared.control.lock().await;
        let config = &self.shared.config;
        let state = &chan.state;
        SessionInfo {
            id: self.shared.id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            security: config.security,
            connected: chan.is_connected(),
            authenticated: state.authenticated,
            ephemeral: self.shared.ephemeral,
            current_directory: state.last_working_directory.clone(),
            server_banner: state.banner.clone(),
            system_type: state.system_type.clone(),
            server_os: state.server_os,
            server_software: state.server_software,
            capabilities: state.capabilities.iter().copied().collect(),
            data_type: state.current_data_type,
            connected_at: state.connected_at,
            reconnect_count: state.reconnect_count,
            label: config.label.clone(),
        }
    }

    // ─── Siblings ────────────────────────────────────────────────────

    /// A new, disconnected session with the same configuration and what
    /// is already known about the server. It starts in the current
    /// working directory.
    pub async fn derive_sibling(&self, ephemeral: bool) -> SessionEngine {
        let state = {
            let chan = self.shared.control.lock().await;
            let parent = &chan.state;
            let mut state = SessionState::new(parent.current_data_type);
            state.capabilities = parent.capabilities.clone();
            state.parser_lock = parent.parser_lock.clone();
            state.server_os = parent.server_os;
            state.server_software = parent.server_software;
            state.system_type = parent.system_type.clone();
            state.restore_directory = parent
                .last_working_directory
                .clone()
                .or_else(|| parent.restore_directory.clone());
            state
        };
        let sibling = Self::from_parts(
            self.shared.config.clone(),
            self.shared.sink.clone(),
            self.shared.tls.clone(),
            state,
            ephemeral,
        );
        self.shared.log(
            Level::Debug,
            &format!("Session {} derived sibling {}", self.shared.id, sibling.shared.id),
        );
        sibling
    }

    /// Open a data connection on a fresh ephemeral sibling so this
    /// session's control connection stays free. The sibling disconnects
    /// when the stream is finished or dropped.
    pub async fn open_data_connection_on_sibling(
        &self,
        direction: TransferDirection,
        data_type: DataType,
        command: &str,
    ) -> FtpResult<DataStream> {
        let sibling = self.derive_sibling(true).await;
        sibling.connect().await?;
        match sibling.open_data_connection(direction, data_type, command).await {
            Ok(mut stream) => {
                stream.attach_owner(sibling);
                Ok(stream)
            }
            Err(e) => {
                let _ = sibling.disconnect().await;
                Err(e)
            }
        }
    }
}

fn with_argument(verb: &str, path: &str) -> String {
    if path.is_empty() {
        verb.to_string()
    } else {
        format!("{} {}", verb, path)
    }
}

/// Servers answer LIST on an empty directory with 450/550 "no files".
fn is_empty_directory_reply(e: &FtpError) -> bool {
    let lower = e.message.to_lowercase();
    matches!(e.code, Some(450) | Some(550))
        && ["no files", "no members", "no data sets", "file not found", "empty"]
            .iter()
            .any(|p| lower.contains(p))
}
