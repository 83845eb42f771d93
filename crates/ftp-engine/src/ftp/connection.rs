//! TCP + TLS transport and session handshake.
//!
//! Lifecycle of one control connection: connect (implicit FTPS wraps the
//! socket immediately) → banner → AUTH TLS + PBSZ/PROT (explicit FTPS) →
//! USER/PASS/ACCT → FEAT (first connection only) → OPTS UTF8 → SYST →
//! TYPE → CWD back to the last known directory.

use crate::ftp::config::{FtpConnectionConfig, FtpSecurityMode};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::logger::FtpLogSink;
use crate::ftp::protocol::FtpCodec;
use crate::ftp::reader::ReplyReader;
use crate::ftp::reply::parse_feat;
use crate::ftp::state::SessionState;
use crate::ftp::tls;
use crate::ftp::types::{Capability, Reply, ServerOs, ServerSoftware};
use chrono::Utc;
use log::Level;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// What a connection attempt needs besides the session state.
pub struct ConnectContext<'a> {
    pub config: &'a FtpConnectionConfig,
    /// Present whenever `config.security` is not `None`.
    pub tls: Option<&'a TlsConnector>,
    pub sink: &'a dyn FtpLogSink,
}

impl<'a> ConnectContext<'a> {
    fn connector(&self) -> FtpResult<&'a TlsConnector> {
        self.tls
            .ok_or_else(|| FtpError::tls_failed("FTPS requested but no TLS connector was built"))
    }

    async fn exchange(&self, codec: &mut FtpCodec, cmd: &str) -> FtpResult<Reply> {
        ReplyReader::new(codec, self.sink, self.config.mask_username)
            .exchange(cmd, self.config.read_timeout())
            .await
    }
}

/// Establish the control connection and return a ready-to-use codec
/// **plus** the server welcome banner.
pub async fn open_control(ctx: &ConnectContext<'_>) -> FtpResult<(FtpCodec, Reply)> {
    let config = ctx.config;
    let addr = format!("{}:{}", config.host, config.port);

    let tcp = timeout(config.connect_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();

    let mut codec = match config.security {
        FtpSecurityMode::Implicit => {
            let (tcp, probe) = crate::ftp::probe::SocketProbe::attach(tcp)?;
            let stream = tls::connect_tls(ctx.connector()?, &config.host, tcp).await?;
            FtpCodec::from_tls(stream, probe)?
        }
        // Explicit upgrades after the banner.
        _ => FtpCodec::from_tcp(tcp)?,
    };

    let mut banner = ReplyReader::new(&mut codec, ctx.sink, config.mask_username)
        .collect("", config.read_timeout())
        .await?;
    // 120: "service ready in nnn minutes", the real greeting follows.
    while banner.code == "120" {
        banner = ReplyReader::new(&mut codec, ctx.sink, config.mask_username)
            .collect("", config.read_timeout())
            .await?;
    }
    if !banner.is_completion() {
        return Err(FtpError::connection_failed(format!(
            "Server refused connection: {}",
            banner
        ))
        .with_code(banner.numeric_code()));
    }
    ctx.sink
        .log(Level::Info, &format!("Connected to {} ({})", addr, banner.message));
    Ok((codec, banner))
}

/// Open a control connection and run the full handshake, updating `state`.
pub async fn establish(ctx: &ConnectContext<'_>, state: &mut SessionState) -> FtpResult<FtpCodec> {
    let config = ctx.config;
    let (mut codec, banner) = open_control(ctx).await?;

    // ── Explicit FTPS: AUTH TLS ──────────────────────────────────
    if config.security == FtpSecurityMode::Explicit {
        let resp = ctx.exchange(&mut codec, "AUTH TLS").await?;
        if !resp.is_completion() {
            return Err(FtpError::tls_failed(format!("AUTH TLS rejected: {}", resp))
                .with_code(resp.numeric_code()));
        }
        codec = tls::upgrade_to_tls(codec, ctx.connector()?, &config.host).await?;
    }
    if config.security != FtpSecurityMode::None {
        // Protection level: private data channel.
        for cmd in ["PBSZ 0", "PROT P"] {
            let resp = ctx.exchange(&mut codec, cmd).await?;
            if !resp.is_completion() {
                return Err(FtpError::tls_failed(format!("{} rejected: {}", cmd, resp))
                    .with_code(resp.numeric_code()));
            }
        }
    }

    // ── Authenticate ─────────────────────────────────────────────
    login(ctx, &mut codec).await?;
    state.authenticated = true;

    // ── FEAT ─────────────────────────────────────────────────────
    if state.capabilities.is_empty() {
        match ctx.exchange(&mut codec, "FEAT").await {
            Ok(r) if r.is_completion() => {
                let caps = parse_feat(&r);
                ctx.sink.log(
                    Level::Debug,
                    &format!("Server features: {}", caps.raw_features.join(", ")),
                );
                state.capabilities = Arc::new(caps);
            }
            Ok(r) => ctx
                .sink
                .log(Level::Debug, &format!("FEAT not supported: {}", r)),
            Err(e) => return Err(e),
        }
    }

    // ── OPTS UTF8 ON ─────────────────────────────────────────────
    if config.utf8 && state.capabilities.has(Capability::Utf8) {
        let _ = ctx.exchange(&mut codec, "OPTS UTF8 ON").await?;
    }

    // ── SYST ─────────────────────────────────────────────────────
    let syst = ctx.exchange(&mut codec, "SYST").await?;
    if syst.is_completion() {
        state.server_os = ServerOs::from_syst(&syst.message);
        state.system_type = Some(syst.message.clone());
    }
    state.banner = Some(banner.text());
    state.server_software = ServerSoftware::from_banner(&banner.text());

    // ── TYPE ─────────────────────────────────────────────────────
    let type_cmd = state.current_data_type.type_command();
    let resp = ctx.exchange(&mut codec, type_cmd).await?;
    if !resp.is_completion() {
        return Err(FtpError::command_rejected(
            resp.numeric_code(),
            format!("{} rejected: {}", type_cmd, resp),
        ));
    }

    // ── Working directory ────────────────────────────────────────
    let target = state
        .restore_directory
        .clone()
        .or_else(|| config.initial_directory.clone());
    if let Some(dir) = target {
        let resp = ctx.exchange(&mut codec, &format!("CWD {}", dir)).await?;
        if resp.is_completion() {
            state.directory_changed(Some(&dir));
        } else {
            ctx.sink
                .log(Level::Warn, &format!("Could not restore directory {}: {}", dir, resp));
        }
    }

    state.connected_at = Some(Utc::now());
    state.needs_reconnect = false;
    state.keepalive_disabled = false;
    state.touch();
    Ok(codec)
}

async fn login(ctx: &ConnectContext<'_>, codec: &mut FtpCodec) -> FtpResult<()> {
    let config = ctx.config;
    let mut resp = ctx
        .exchange(codec, &format!("USER {}", config.username))
        .await?;
    if resp.code == "331" {
        resp = ctx
            .exchange(codec, &format!("PASS {}", config.password))
            .await?;
    }
    if resp.code == "332" {
        let account = config.account.as_deref().ok_or_else(|| {
            FtpError::auth_failed("Server requires an account (ACCT) but none is configured")
                .with_code(332)
        })?;
        resp = ctx.exchange(codec, &format!("ACCT {}", account)).await?;
    }
    if !resp.is_completion() {
        return Err(FtpError::auth_failed(format!("Login failed: {}", resp))
            .with_code(resp.numeric_code()));
    }
    ctx.sink.log(
        Level::Info,
        &format!(
            "Logged in as {}",
            if config.mask_username { "****" } else { config.username.as_str() }
        ),
    );
    Ok(())
}
