//! Control-connection line codec (RFC 959 §4).
//!
//! Handles:
//! - Sending command lines terminated with `\r\n`
//! - Reading reply lines with a per-read timeout
//! - Detecting stale bytes left on the socket by an earlier exchange
//!
//! Reply assembly lives in [`crate::ftp::reader`]; this layer only moves
//! lines.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::probe::SocketProbe;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// How long the stale-data check waits for bytes that are already in
/// flight.
const STALE_POLL: Duration = Duration::from_millis(5);

/// Abstraction over plain TCP or TLS-wrapped read half.
pub enum ReadHalf {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

/// Abstraction over plain TCP or TLS-wrapped write half.
pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

/// The control-channel codec operating on split halves.
pub struct FtpCodec {
    reader: ReadHalf,
    writer: WriteHalf,
    peer: SocketAddr,
    local: SocketAddr,
    probe: SocketProbe,
    lines_read: u64,
}

impl FtpCodec {
    /// Create a codec from a plain TCP stream.
    pub fn from_tcp(stream: TcpStream) -> FtpResult<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (stream, probe) = SocketProbe::attach(stream)?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            reader: ReadHalf::Plain(BufReader::new(rd)),
            writer: WriteHalf::Plain(wr),
            peer,
            local,
            probe,
            lines_read: 0,
        })
    }

    /// Create a codec from a TLS-wrapped TCP stream. `probe` must belong
    /// to the stream's underlying socket.
    pub fn from_tls(stream: TlsStream<TcpStream>, probe: SocketProbe) -> FtpResult<Self> {
        let (peer, local) = {
            let (tcp, _) = stream.get_ref();
            (tcp.peer_addr()?, tcp.local_addr()?)
        };
        let (rd, wr) = tokio::io::split(stream);
        Ok(Self {
            reader: ReadHalf::Tls(BufReader::new(rd)),
            writer: WriteHalf::Tls(wr),
            peer,
            local,
            probe,
            lines_read: 0,
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.writer, WriteHalf::Tls(_))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn probe(&self) -> &SocketProbe {
        &self.probe
    }

    /// Reply lines read since the connection (or the TLS session) started.
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Send one command line (without trailing CRLF, we add it).
    pub async fn send_line(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        match &mut self.writer {
            WriteHalf::Plain(w) => {
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
            WriteHalf::Tls(w) => {
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
        }
        Ok(())
    }

    /// Read one line, without its line terminator. A read that produces no
    /// bytes within `timeout` fails with a timeout error.
    pub async fn read_line(&mut self, timeout: Duration) -> FtpResult<String> {
        let mut buf = String::new();
        let read = async {
            match &mut self.reader {
                ReadHalf::Plain(r) => r.read_line(&mut buf).await,
                ReadHalf::Tls(r) => r.read_line(&mut buf).await,
            }
        };
        let n = match tokio::time::timeout(timeout, read).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(FtpError::timeout(format!(
                    "No reply from {} within {} ms",
                    self.peer,
                    timeout.as_millis()
                )))
            }
        };
        if n == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        self.lines_read += 1;
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Collect whatever the server sent that nobody asked for. An empty
    /// result means the channel is in sync.
    pub async fn drain_stale(&mut self) -> FtpResult<Vec<String>> {
        let mut bytes = Vec::new();
        loop {
            let chunk = async {
                match &mut self.reader {
                    ReadHalf::Plain(r) => {
                        let buf = r.fill_buf().await?;
                        let out = buf.to_vec();
                        r.consume(out.len());
                        Ok::<_, std::io::Error>(out)
                    }
                    ReadHalf::Tls(r) => {
                        let buf = r.fill_buf().await?;
                        let out = buf.to_vec();
                        r.consume(out.len());
                        Ok(out)
                    }
                }
            };
            match tokio::time::timeout(STALE_POLL, chunk).await {
                Err(_) => break,
                Ok(Ok(chunk)) if chunk.is_empty() => {
                    return Err(FtpError::disconnected("Server closed connection"));
                }
                Ok(Ok(chunk)) => bytes.extend_from_slice(&chunk),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    /// Best-effort close of the write side.
    pub async fn shutdown(&mut self) {
        let _ = match &mut self.writer {
            WriteHalf::Plain(w) => w.shutdown().await,
            WriteHalf::Tls(w) => w.shutdown().await,
        };
    }

    /// Take the plain socket back out of the codec, for an `AUTH TLS`
    /// upgrade. Fails on a codec that is already TLS.
    pub fn into_plain_parts(self) -> FtpResult<(TcpStream, SocketProbe)> {
        let rd = match self.reader {
            ReadHalf::Plain(br) => {
                if !br.buffer().is_empty() {
                    return Err(FtpError::protocol_error(
                        "Cannot upgrade: unread data on the control connection",
                    ));
                }
                br.into_inner()
            }
            ReadHalf::Tls(_) => {
                return Err(FtpError::protocol_error(
                    "Cannot upgrade: connection is already TLS",
                ))
            }
        };
        let wr = match self.writer {
            WriteHalf::Plain(w) => w,
            WriteHalf::Tls(_) => {
                return Err(FtpError::protocol_error(
                    "Cannot upgrade: connection is already TLS",
                ))
            }
        };
        let tcp = rd
            .reunite(wr)
            .map_err(|e| FtpError::protocol_error(format!("Reunite failed: {}", e)))?;
        Ok((tcp, self.probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (FtpCodec, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (FtpCodec::from_tcp(client).unwrap(), server)
    }

    #[tokio::test]
    async fn sends_crlf_terminated_lines() {
        let (mut codec, mut server) = pair().await;
        codec.send_line("NOOP").await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NOOP\r\n");
    }

    #[tokio::test]
    async fn reads_lines_and_counts_them() {
        let (mut codec, mut server) = pair().await;
        server.write_all(b"220-Hello\r\n220 Ready\r\n").await.unwrap();
        let timeout = Duration::from_secs(2);
        assert_eq!(codec.read_line(timeout).await.unwrap(), "220-Hello");
        assert_eq!(codec.read_line(timeout).await.unwrap(), "220 Ready");
        assert_eq!(codec.lines_read(), 2);
    }

    #[tokio::test]
    async fn read_times_out() {
        let (mut codec, _server) = pair().await;
        let err = codec.read_line(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::Timeout);
    }

    #[tokio::test]
    async fn stale_data_is_reported() {
        let (mut codec, mut server) = pair().await;
        assert!(codec.drain_stale().await.unwrap().is_empty());

        server.write_all(b"226 Transfer complete\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stale = codec.drain_stale().await.unwrap();
        assert_eq!(stale, vec!["226 Transfer complete"]);
        assert!(codec.drain_stale().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn peer_close_is_disconnect() {
        let (mut codec, server) = pair().await;
        drop(server);
        let err = codec.read_line(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
