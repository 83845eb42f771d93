//! Transport-level liveness probe.
//!
//! A probe holds a duplicate descriptor of a connected socket so it can be
//! checked without touching the buffered reader that owns the stream. The
//! check is a non-blocking one-byte `peek`, which never consumes data.

use crate::ftp::error::FtpResult;
use std::net::Shutdown;
use tokio::net::TcpStream;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Socket is open; `pending` is true when unread bytes are waiting.
    Alive { pending: bool },
    /// Peer closed the connection or the socket errored.
    Dead(String),
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive { .. })
    }
}

#[derive(Debug)]
pub struct SocketProbe {
    dup: std::net::TcpStream,
}

impl SocketProbe {
    /// Split off a probe for `stream`. The returned stream is the same
    /// socket, re-registered with the runtime.
    pub fn attach(stream: TcpStream) -> FtpResult<(TcpStream, SocketProbe)> {
        // `into_std` leaves the socket in non-blocking mode, which the
        // duplicate shares, so `peek` below never blocks.
        let std_stream = stream.into_std()?;
        let dup = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;
        Ok((stream, SocketProbe { dup }))
    }

    pub fn check(&self) -> Liveness {
        let mut byte = [0u8; 1];
        match self.dup.peek(&mut byte) {
            Ok(0) => Liveness::Dead("connection closed by peer".into()),
            Ok(_) => Liveness::Alive { pending: true },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Liveness::Alive { pending: false }
            }
            Err(e) => Liveness::Dead(e.to_string()),
        }
    }

    /// Shut the underlying socket down in both directions. Every handle to
    /// it (including the owning stream) sees EOF / errors afterwards.
    pub fn close(&self) {
        let _ = self.dup.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn detects_pending_data_and_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let (_client, probe) = SocketProbe::attach(client).unwrap();
        assert_eq!(probe.check(), Liveness::Alive { pending: false });

        server.write_all(b"421 bye\r\n").await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(probe.check(), Liveness::Alive { pending: true });

        drop(server);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Pending bytes are still readable; the EOF is only visible once
        // they have been consumed, so peek keeps reporting data.
        assert!(probe.check().is_alive());
    }

    #[tokio::test]
    async fn idle_closed_socket_is_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_client, probe) = SocketProbe::attach(client).unwrap();

        drop(server);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!probe.check().is_alive());
    }
}
