//! Data-connection negotiation and the data stream.
//!
//! Supports four wire modes (RFC 959 + RFC 2428):
//! - **PASV**: server opens a port, client connects
//! - **EPSV**: extended passive, connects to the control peer's address
//! - **PORT**: client opens a port, tells server
//! - **EPRT**: extended active (IPv6-ready)
//!
//! The transfer command is sent as part of opening the stream because an
//! active-mode server only connects back after receiving it. The data
//! socket is TLS-wrapped when the session is FTPS (PROT P).

use crate::ftp::config::FtpSecurityMode;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::executor::{CommandExecutor, ControlChannel, SessionShared};
use crate::ftp::liveness::DataSocketWatch;
use crate::ftp::probe::SocketProbe;
use crate::ftp::reader::{expect_completion, ReplyReader};
use crate::ftp::session::SessionEngine;
use crate::ftp::tls;
use crate::ftp::types::{
    Capability, CapabilitySet, DataConnectionDescriptor, DataConnectionMode, DataType, Reply,
    TransferDirection,
};
use lazy_static::lazy_static;
use log::Level;
use regex::Regex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_rustls::client::TlsStream;

lazy_static! {
    static ref PASV_ADDR: Regex =
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
}

// ─── Reply parsing ───────────────────────────────────────────────────

/// Parse `h1,h2,h3,h4,p1,p2` out of a 227 reply. Parentheses are optional;
/// some servers omit them.
pub fn parse_pasv(reply: &Reply) -> FtpResult<(Ipv4Addr, u16)> {
    let caps = PASV_ADDR
        .captures(&reply.message)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", reply)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error(format!("PASV number out of range: {}", reply)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok((ip, port))
}

/// Parse the port out of `229 Entering Extended Passive Mode (|||6446|)`.
/// The delimiter is whatever printable character the server chose.
pub fn parse_epsv(reply: &Reply) -> FtpResult<u16> {
    let bad = || FtpError::protocol_error(format!("Cannot parse EPSV: {}", reply));
    let text = &reply.message;
    let open = text.find('(').ok_or_else(bad)?;
    let body = &text[open + 1..];
    let close = body.find(')').ok_or_else(bad)?;
    let body = &body[..close];

    let delim = body.chars().next().ok_or_else(bad)?;
    if delim.is_ascii_digit() || !delim.is_ascii_graphic() {
        return Err(bad());
    }
    let fields: Vec<&str> = body.split(delim).collect();
    // "|||6446|" splits into ["", "", "", "6446", ""].
    if fields.len() != 5 || fields.iter().enumerate().any(|(i, f)| i != 3 && !f.is_empty()) {
        return Err(bad());
    }
    fields[3].parse::<u16>().map_err(|_| bad())
}

/// Pick the host to connect to for a PASV reply. A private or
/// unroutable address from a server on a public address is almost always
/// a NAT artefact, so the control host is used instead, unless the client
/// sits behind a proxy that makes such addresses meaningful.
pub fn resolve_passive_host(advertised: Ipv4Addr, control_host: &str, behind_proxy: bool) -> String {
    let unroutable = advertised.is_private()
        || advertised.is_loopback()
        || advertised.is_unspecified()
        || advertised.is_link_local();
    if unroutable && !behind_proxy {
        control_host.to_string()
    } else {
        advertised.to_string()
    }
}

pub fn port_command(addr: SocketAddr) -> FtpResult<String> {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            let port = addr.port();
            Ok(format!(
                "PORT {},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                port / 256,
                port % 256
            ))
        }
        IpAddr::V6(_) => Err(FtpError::data_channel("PORT requires IPv4; use EPRT")),
    }
}

/// `EPRT |1|ip|port|` (1 = IPv4, 2 = IPv6).
pub fn eprt_command(addr: SocketAddr) -> String {
    let af = match addr.ip() {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    format!("EPRT |{}|{}|{}|", af, addr.ip(), addr.port())
}

/// Resolve the automatic modes against what the server supports.
pub fn effective_mode(
    configured: DataConnectionMode,
    caps: &CapabilitySet,
    peer: SocketAddr,
) -> DataConnectionMode {
    let v6 = peer.is_ipv6();
    match configured {
        DataConnectionMode::AutoPassive => {
            if caps.has(Capability::Epsv) || v6 {
                DataConnectionMode::ExtendedPassive
            } else {
                DataConnectionMode::Passive
            }
        }
        DataConnectionMode::AutoActive => {
            if caps.has(Capability::Eprt) || v6 {
                DataConnectionMode::ExtendedActive
            } else {
                DataConnectionMode::Active
            }
        }
        other => other,
    }
}

// ─── Data socket ─────────────────────────────────────────────────────

/// Abstraction over a plain or TLS-wrapped data socket.
pub enum DataSocket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataSocket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataSocket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataSocket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DataSocket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataSocket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataSocket::Plain(s) => Pin::new(s).poll_flush(cx),
            DataSocket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataSocket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataSocket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Negotiated but possibly not yet connected data socket.
enum PendingData {
    Connected(TcpStream),
    Listening(TcpListener),
}

/// An open data connection.
///
/// Call [`DataStream::finish`] once the bytes are moved: it closes the
/// socket and reads the transfer's final reply. A stream dropped without
/// `finish` leaves that reply unread, so the session reconnects before its
/// next command.
pub struct DataStream {
    socket: DataSocket,
    descriptor: DataConnectionDescriptor,
    direction: TransferDirection,
    command: String,
    shared: Arc<SessionShared>,
    last_activity: Arc<StdMutex<Instant>>,
    /// Final reply, when the server sent it together with the 1xx.
    early_reply: Option<Reply>,
    /// Ephemeral sibling session that owns the control connection.
    owner: Option<SessionEngine>,
    finished: bool,
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("descriptor", &self.descriptor)
            .field("direction", &self.direction)
            .field("command", &self.command)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl DataStream {
    pub fn descriptor(&self) -> &DataConnectionDescriptor {
        &self.descriptor
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.socket, DataSocket::Tls(_))
    }

    /// Tie the lifetime of a sibling session to this stream.
    pub(crate) fn attach_owner(&mut self, owner: SessionEngine) {
        self.owner = Some(owner);
    }

    fn mark_activity(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    /// Close the data socket and collect the final reply of the transfer.
    pub async fn finish(mut self) -> FtpResult<Reply> {
        self.finished = true;
        let data_timeout = self.shared.config.data_timeout();
        let _ = timeout(data_timeout, self.socket.shutdown()).await;
        self.shared.clear_data_watch();

        let result = {
            let mut chan = self.shared.control.lock().await;
            let r = read_final_reply(&self.shared, &mut chan, self.early_reply.take(), &self.command)
                .await;
            chan.state.transfer_open = false;
            chan.state.touch();
            r
        };

        if let Some(owner) = self.owner.take() {
            let _ = owner.disconnect().await;
        }
        result
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.shared.clear_data_watch();
        self.shared.log(
            Level::Warn,
            &format!("Data stream for {} dropped before completion", self.command),
        );
        let abandoned = match self.shared.control.try_lock() {
            Ok(mut chan) => {
                chan.state.transfer_open = false;
                chan.state.needs_reconnect = true;
                true
            }
            Err(_) => false,
        };
        let shared = self.shared.clone();
        let owner = self.owner.take();
        if abandoned && owner.is_none() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if !abandoned {
                    let mut chan = shared.control.lock().await;
                    chan.state.transfer_open = false;
                    chan.state.needs_reconnect = true;
                }
                if let Some(owner) = owner {
                    let _ = owner.disconnect().await;
                }
            });
        }
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.socket).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.mark_activity();
        }
        res
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.socket).poll_write(cx, buf);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            this.mark_activity();
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket).poll_shutdown(cx)
    }
}

// ─── Negotiation ─────────────────────────────────────────────────────

/// Negotiate a data connection, send `command` (RETR, STOR, LIST, ...)
/// and return the connected stream.
pub async fn open(
    shared: &Arc<SessionShared>,
    direction: TransferDirection,
    data_type: DataType,
    command: &str,
) -> FtpResult<DataStream> {
    let exec = CommandExecutor::new(shared);
    let mut guard = shared.control.lock().await;
    let chan = &mut *guard;
    exec.ensure_connected(chan).await?;

    if chan.state.transfer_open {
        return Err(FtpError::data_channel(
            "A data transfer is already open on this session",
        ));
    }
    if chan.state.current_data_type != data_type {
        expect_completion(exec.execute_locked(chan, data_type.type_command()).await?)?;
    }

    if shared.config.stale_data_check {
        exec.discard_stale(chan).await?;
    }
    chan.state.in_critical_sequence = true;
    let result = negotiate_and_start(shared, &exec, chan, command).await;
    chan.state.in_critical_sequence = false;

    let (socket, descriptor, early_reply, probe) = result?;
    let last_activity = Arc::new(StdMutex::new(Instant::now()));
    if let Ok(mut watch) = shared.data_watch.lock() {
        *watch = Some(DataSocketWatch::new(probe, last_activity.clone()));
    }
    chan.state.transfer_open = true;
    chan.state.touch();

    shared.log(
        Level::Debug,
        &format!(
            "Data connection open ({:?} {}:{}, {:?}) for {}",
            descriptor.mode, descriptor.remote_host, descriptor.remote_port, direction, command
        ),
    );

    Ok(DataStream {
        socket,
        descriptor,
        direction,
        command: command.to_string(),
        shared: shared.clone(),
        last_activity,
        early_reply,
        owner: None,
        finished: false,
    })
}

type Negotiated = (DataSocket, DataConnectionDescriptor, Option<Reply>, SocketProbe);

async fn negotiate_and_start(
    shared: &SessionShared,
    exec: &CommandExecutor<'_>,
    chan: &mut ControlChannel,
    command: &str,
) -> FtpResult<Negotiated> {
    let config = &shared.config;
    let (peer, local) = chan
        .codec
        .as_ref()
        .map(|c| (c.peer_addr(), c.local_addr()))
        .ok_or_else(|| FtpError::not_connected("No control connection"))?;
    let caps = chan.state.capabilities.clone();

    if caps.has(Capability::Pret) {
        let r = exec.execute_locked(chan, &format!("PRET {}", command)).await?;
        if !r.is_completion() {
            shared.log(Level::Debug, &format!("PRET refused: {}", r));
        }
    }

    let mode = effective_mode(config.data_connection_mode, &caps, peer);
    let auto = matches!(
        config.data_connection_mode,
        DataConnectionMode::AutoPassive | DataConnectionMode::AutoActive
    );
    let (pending, descriptor) = match mode {
        DataConnectionMode::Passive | DataConnectionMode::ExtendedPassive => {
            negotiate_passive(shared, exec, chan, mode, auto, peer).await?
        }
        _ => negotiate_active(shared, exec, chan, mode, auto, local).await?,
    };

    // ── Transfer command ─────────────────────────────────────────
    let reply = exec.execute_locked(chan, command).await?;
    let early_reply = if reply.is_preliminary() {
        None
    } else if reply.is_completion() {
        Some(reply)
    } else {
        return Err(FtpError::from_reply(reply.numeric_code(), &reply.text()));
    };

    let tcp = match pending {
        PendingData::Connected(tcp) => tcp,
        PendingData::Listening(listener) => {
            let (tcp, from) = timeout(config.data_timeout(), listener.accept())
                .await
                .map_err(|_| FtpError::data_channel("Active-mode accept timed out"))?
                .map_err(|e| FtpError::data_channel(format!("Active-mode accept: {}", e)))?;
            if from.ip() != peer.ip() {
                shared.log(
                    Level::Warn,
                    &format!("Data connection from {} (control peer is {})", from, peer),
                );
            }
            tcp
        }
    };
    tcp.set_nodelay(true).ok();
    let (tcp, probe) = SocketProbe::attach(tcp)?;

    let socket = if config.security != FtpSecurityMode::None {
        let connector = shared
            .tls
            .as_ref()
            .ok_or_else(|| FtpError::tls_failed("FTPS session without a TLS connector"))?;
        DataSocket::Tls(Box::new(
            tls::wrap_data_stream(connector, &config.host, tcp).await?,
        ))
    } else {
        DataSocket::Plain(tcp)
    };

    Ok((socket, descriptor, early_reply, probe))
}

async fn negotiate_passive(
    shared: &SessionShared,
    exec: &CommandExecutor<'_>,
    chan: &mut ControlChannel,
    mode: DataConnectionMode,
    auto: bool,
    peer: SocketAddr,
) -> FtpResult<(PendingData, DataConnectionDescriptor)> {
    let config = &shared.config;
    let mut mode = mode;

    let (host, port) = loop {
        if mode == DataConnectionMode::ExtendedPassive {
            let reply = exec.execute_locked(chan, "EPSV").await?;
            if reply.is_completion() {
                break (peer.ip().to_string(), parse_epsv(&reply)?);
            }
            if !auto || peer.is_ipv6() {
                return Err(FtpError::from_reply(reply.numeric_code(), &reply.text()));
            }
            shared.log(Level::Debug, &format!("EPSV refused ({}), falling back to PASV", reply));
            mode = DataConnectionMode::Passive;
            continue;
        }
        let reply = expect_completion(exec.execute_locked(chan, "PASV").await?)?;
        let (ip, port) = parse_pasv(&reply)?;
        break (resolve_passive_host(ip, &config.host, config.behind_proxy), port);
    };

    let addr = format!("{}:{}", host, port);
    let tcp = timeout(config.data_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::data_channel(format!("Data connect to {} timed out", addr)))?
        .map_err(|e| FtpError::data_channel(format!("Data connect to {}: {}", addr, e)))?;

    let descriptor = DataConnectionDescriptor {
        mode,
        remote_host: host,
        remote_port: port,
        local_bind_port: None,
    };
    Ok((PendingData::Connected(tcp), descriptor))
}

async fn negotiate_active(
    shared: &SessionShared,
    exec: &CommandExecutor<'_>,
    chan: &mut ControlChannel,
    mode: DataConnectionMode,
    auto: bool,
    control_local: SocketAddr,
) -> FtpResult<(PendingData, DataConnectionDescriptor)> {
    let config = &shared.config;
    let bind_ip: IpAddr = match &config.active_bind_address {
        Some(a) => a
            .parse()
            .map_err(|_| FtpError::invalid_config(format!("Invalid active bind address: {}", a)))?,
        None => control_local.ip(),
    };

    let listener = bind_active_listener(shared, bind_ip, &config.active_ports).await?;
    let local = listener
        .local_addr()
        .map_err(|e| FtpError::data_channel(format!("Active-mode local address: {}", e)))?;

    let mut mode = mode;
    loop {
        let cmd = if mode == DataConnectionMode::ExtendedActive {
            eprt_command(local)
        } else {
            port_command(local)?
        };
        let reply = exec.execute_locked(chan, &cmd).await?;
        if reply.is_completion() {
            break;
        }
        if mode == DataConnectionMode::ExtendedActive && auto && local.is_ipv4() {
            shared.log(Level::Debug, &format!("EPRT refused ({}), falling back to PORT", reply));
            mode = DataConnectionMode::Active;
            continue;
        }
        return Err(FtpError::from_reply(reply.numeric_code(), &reply.text()));
    }

    let descriptor = DataConnectionDescriptor {
        mode,
        remote_host: local.ip().to_string(),
        remote_port: local.port(),
        local_bind_port: Some(local.port()),
    };
    Ok((PendingData::Listening(listener), descriptor))
}

/// Bind the first free port from `candidates` (or any port when the list
/// is empty).
async fn bind_active_listener(
    shared: &SessionShared,
    ip: IpAddr,
    candidates: &[u16],
) -> FtpResult<TcpListener> {
    if candidates.is_empty() {
        return TcpListener::bind(SocketAddr::new(ip, 0))
            .await
            .map_err(|e| FtpError::data_channel(format!("Active-mode bind on {}: {}", ip, e)));
    }
    for &port in candidates {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => shared.log(
                Level::Debug,
                &format!("Active-mode port {} unavailable: {}", port, e),
            ),
        }
    }
    Err(FtpError::data_channel(format!(
        "No free active-mode port among {} candidates",
        candidates.len()
    )))
}

/// Read the final reply of a transfer, swallowing keep-alive replies that
/// were deferred while it ran.
async fn read_final_reply(
    shared: &SessionShared,
    chan: &mut ControlChannel,
    early: Option<Reply>,
    command: &str,
) -> FtpResult<Reply> {
    let config = &shared.config;
    let codec = chan
        .codec
        .as_mut()
        .ok_or_else(|| FtpError::disconnected("Control connection lost during transfer"))?;

    let outcome = if chan.state.pending_keepalive_replies > 0 {
        let mut pending = chan.state.pending_keepalive_replies;
        let drained = ReplyReader::new(codec, shared.sink(), config.mask_username)
            .drain("NOOP", config.drain_window(), &mut pending, early.is_none())
            .await;
        chan.state.pending_keepalive_replies = pending;
        if pending > 0 {
            // Replies still owed: the channel cannot be trusted.
            chan.state.needs_reconnect = true;
        }
        match (early, drained) {
            (Some(reply), _) => Ok(reply),
            (None, Ok(Some(mut reply))) => {
                reply.originating_command = command.to_string();
                Ok(reply)
            }
            (None, Ok(None)) => Err(FtpError::timeout(format!(
                "No final reply for {} within the drain window",
                command
            ))),
            (None, Err(e)) => Err(e),
        }
    } else if let Some(reply) = early {
        Ok(reply)
    } else {
        ReplyReader::new(codec, shared.sink(), config.mask_username)
            .collect(command, config.read_timeout())
            .await
    };

    match outcome {
        Ok(reply) => expect_completion(reply),
        Err(e) => {
            chan.state.needs_reconnect = true;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_parsing() {
        let r = Reply::new("227", "Entering Passive Mode (192,168,1,10,195,80)");
        assert_eq!(parse_pasv(&r).unwrap(), (Ipv4Addr::new(192, 168, 1, 10), 50000));
        let bare = Reply::new("227", "=10,0,0,5,19,136");
        assert_eq!(parse_pasv(&bare).unwrap().1, 5000);
        assert!(parse_pasv(&Reply::new("227", "(300,1,1,1,1,1)")).is_err());
        assert!(parse_pasv(&Reply::new("227", "no address")).is_err());
    }

    #[test]
    fn epsv_reply_parsing() {
        let r = Reply::new("229", "Entering Extended Passive Mode (|||6446|)");
        assert_eq!(parse_epsv(&r).unwrap(), 6446);
        let other = Reply::new("229", "Entering Extended Passive Mode (!!!2121!)");
        assert_eq!(parse_epsv(&other).unwrap(), 2121);
        assert!(parse_epsv(&Reply::new("229", "(|1|2|3|)")).is_err());
        assert!(parse_epsv(&Reply::new("229", "(|||99999|)")).is_err());
    }

    #[test]
    fn private_pasv_addresses_are_replaced() {
        let private = Ipv4Addr::new(10, 0, 0, 5);
        assert_eq!(resolve_passive_host(private, "ftp.example.com", false), "ftp.example.com");
        assert_eq!(resolve_passive_host(private, "ftp.example.com", true), "10.0.0.5");
        let public = Ipv4Addr::new(203, 0, 113, 7);
        assert_eq!(resolve_passive_host(public, "ftp.example.com", false), "203.0.113.7");
    }

    #[test]
    fn active_commands() {
        let addr: SocketAddr = "192.0.2.1:50000".parse().unwrap();
        assert_eq!(port_command(addr).unwrap(), "PORT 192,0,2,1,195,80");
        assert_eq!(eprt_command(addr), "EPRT |1|192.0.2.1|50000|");
        let v6: SocketAddr = "[2001:db8::1]:2121".parse().unwrap();
        assert!(port_command(v6).is_err());
        assert_eq!(eprt_command(v6), "EPRT |2|2001:db8::1|2121|");
    }

    fn unconnected_shared() -> SessionShared {
        SessionShared::for_tests(crate::ftp::config::FtpConnectionConfig::new("127.0.0.1", 21), None)
    }

    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn active_bind_skips_busy_ports() {
        let s = unconnected_shared();
        let lo: IpAddr = Ipv4Addr::LOCALHOST.into();
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let free = free_port().await;

        let listener = bind_active_listener(&s, lo, &[busy_port, free]).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), free);
    }

    #[tokio::test]
    async fn active_bind_fails_when_every_candidate_is_taken() {
        let s = unconnected_shared();
        let lo: IpAddr = Ipv4Addr::LOCALHOST.into();
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ports = [a.local_addr().unwrap().port(), b.local_addr().unwrap().port()];

        let err = bind_active_listener(&s, lo, &ports).await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::DataChannelFailed);
        assert!(err.message.contains("2 candidates"), "{}", err.message);
    }

    #[tokio::test]
    async fn active_bind_without_candidates_uses_any_port() {
        let s = unconnected_shared();
        let listener = bind_active_listener(&s, Ipv4Addr::LOCALHOST.into(), &[]).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(port_command(addr).unwrap(), format!("PORT 127,0,0,1,{},{}", addr.port() / 256, addr.port() % 256));
    }

    #[test]
    fn auto_modes_follow_capabilities() {
        let peer: SocketAddr = "192.0.2.1:21".parse().unwrap();
        let none = CapabilitySet::new();
        let epsv: CapabilitySet = [Capability::Epsv, Capability::Eprt].into_iter().collect();
        assert_eq!(
            effective_mode(DataConnectionMode::AutoPassive, &none, peer),
            DataConnectionMode::Passive
        );
        assert_eq!(
            effective_mode(DataConnectionMode::AutoPassive, &epsv, peer),
            DataConnectionMode::ExtendedPassive
        );
        assert_eq!(
            effective_mode(DataConnectionMode::AutoActive, &epsv, peer),
            DataConnectionMode::ExtendedActive
        );
        assert_eq!(
            effective_mode(DataConnectionMode::Active, &epsv, peer),
            DataConnectionMode::Active
        );
    }
}
