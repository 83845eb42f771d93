//! Reply reader.
//!
//! Turns control-channel lines into [`Reply`] values. Two modes:
//!
//! - **Collecting**: read until the first final reply line.
//! - **Draining**: used to resynchronise after keep-alive commands were
//!   sent without reading their replies (the data transfer was open). A
//!   probe command is sent, keep-alive acknowledgements are swallowed, and
//!   the first reply that is not one of them is returned. The window is
//!   bounded; if it elapses with only keep-alive noise the result is `None`.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::logger::{mask_command, FtpLogSink};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::reply::ReplyAccumulator;
use crate::ftp::types::Reply;
use log::Level;
use std::time::Duration;
use tokio::time::Instant;

/// Reader lifecycle. A reader is single-use; `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    AwaitingReply,
    Collecting,
    Draining,
    Done,
}

/// Reply codes produced by the commands in the keep-alive pools.
fn is_keepalive_ack(reply: &Reply) -> bool {
    matches!(reply.code.as_str(), "200" | "215" | "257")
}

pub struct ReplyReader<'a> {
    codec: &'a mut FtpCodec,
    sink: &'a dyn FtpLogSink,
    mask_username: bool,
    state: ReaderState,
    acc: ReplyAccumulator,
}

impl<'a> ReplyReader<'a> {
    pub fn new(codec: &'a mut FtpCodec, sink: &'a dyn FtpLogSink, mask_username: bool) -> Self {
        Self {
            codec,
            sink,
            mask_username,
            state: ReaderState::Idle,
            acc: ReplyAccumulator::new(),
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Send `cmd` and collect its reply.
    pub async fn exchange(mut self, cmd: &str, read_timeout: Duration) -> FtpResult<Reply> {
        let masked = mask_command(cmd, self.mask_username);
        self.sink.log(Level::Trace, &format!(">>> {}", masked));
        self.codec.send_line(cmd).await?;
        self.collect_for(&masked, read_timeout).await
    }

    /// Collect the reply to a command that was already sent.
    pub async fn collect(mut self, cmd: &str, read_timeout: Duration) -> FtpResult<Reply> {
        let masked = mask_command(cmd, self.mask_username);
        self.collect_for(&masked, read_timeout).await
    }

    async fn collect_for(&mut self, masked: &str, read_timeout: Duration) -> FtpResult<Reply> {
        self.state = ReaderState::AwaitingReply;
        loop {
            let line = self.codec.read_line(read_timeout).await?;
            self.state = ReaderState::Collecting;
            if let Some(reply) = self.acc.feed(&line) {
                return Ok(self.finish(reply, masked));
            }
        }
    }

    /// Send `probe`, then read for up to `window`, discarding
    /// acknowledgements of unread keep-alive commands. `pending` counts
    /// those commands and is decremented as their replies are swallowed.
    ///
    /// With `expect_reply` set the reader waits for one reply that is not a
    /// keep-alive acknowledgement (the final reply of a transfer). Without
    /// it, the reader stops as soon as the probe and every pending
    /// keep-alive have been answered.
    pub async fn drain(
        mut self,
        probe: &str,
        window: Duration,
        pending: &mut u32,
        expect_reply: bool,
    ) -> FtpResult<Option<Reply>> {
        self.sink.log(
            Level::Debug,
            &format!("Draining control channel ({} keep-alive replies pending)", pending),
        );
        self.sink.log(Level::Trace, &format!(">>> {}", probe));
        self.codec.send_line(probe).await?;
        *pending += 1;

        self.state = ReaderState::Draining;
        let deadline = Instant::now() + window;
        let mut real: Option<Reply> = None;

        loop {
            if *pending == 0 && (real.is_some() || !expect_reply) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                self.sink.log(
                    Level::Debug,
                    &format!("Drain window elapsed with {} replies outstanding", pending),
                );
                break;
            }
            let line = match self.codec.read_line(deadline - now).await {
                Ok(line) => line,
                Err(e) if e.kind == FtpErrorKind::Timeout => break,
                Err(e) => return Err(e),
            };
            let Some(reply) = self.acc.feed(&line) else {
                continue;
            };
            if *pending > 0 && is_keepalive_ack(&reply) {
                *pending -= 1;
                self.sink
                    .log(Level::Trace, &format!("<<< {} (keep-alive, discarded)", reply));
                continue;
            }
            if real.is_none() {
                real = Some(reply);
            } else {
                self.sink
                    .log(Level::Warn, &format!("Unexpected extra reply while draining: {}", reply));
            }
        }

        self.state = ReaderState::Done;
        Ok(real.map(|r| {
            self.sink.log(Level::Trace, &format!("<<< {}", r));
            r
        }))
    }

    fn finish(&mut self, mut reply: Reply, masked: &str) -> Reply {
        self.state = ReaderState::Done;
        reply.originating_command = masked.to_string();
        self.sink.log(Level::Trace, &format!("<<< {}", reply));
        reply
    }
}

/// Expect a 2xx reply; turn anything else into an error classified by
/// code.
pub fn expect_completion(reply: Reply) -> FtpResult<Reply> {
    if reply.is_completion() {
        Ok(reply)
    } else {
        Err(FtpError::from_reply(reply.numeric_code(), &reply.text()))
    }
}

/// Expect a 1xx/2xx/3xx reply.
pub fn expect_success(reply: Reply) -> FtpResult<Reply> {
    if reply.is_success() {
        Ok(reply)
    } else {
        Err(FtpError::from_reply(reply.numeric_code(), &reply.text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::logger::LogFacadeSink;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (FtpCodec, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (FtpCodec::from_tcp(client).unwrap(), server)
    }

    #[tokio::test]
    async fn exchange_masks_credentials_in_reply() {
        let (mut codec, server) = pair().await;
        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(server);
            let mut cmd = String::new();
            lines.read_line(&mut cmd).await.unwrap();
            assert_eq!(cmd, "PASS secret\r\n");
            lines.get_mut().write_all(b"230 Logged in\r\n").await.unwrap();
        });
        let sink = LogFacadeSink;
        let reader = ReplyReader::new(&mut codec, &sink, false);
        assert_eq!(reader.state(), ReaderState::Idle);
        let reply = reader
            .exchange("PASS secret", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.code, "230");
        assert_eq!(reply.originating_command, "PASS ****");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn drain_swallows_keepalive_acks() {
        let (mut codec, mut server) = pair().await;
        // Two NOOPs went out during the transfer, then the transfer finished.
        server
            .write_all(b"200 NOOP ok\r\n200 NOOP ok\r\n226 Transfer complete\r\n200 probe ok\r\n")
            .await
            .unwrap();
        let sink = LogFacadeSink;
        let mut pending = 2;
        let reply = ReplyReader::new(&mut codec, &sink, false)
            .drain("NOOP", Duration::from_secs(2), &mut pending, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.code, "226");
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn drain_window_elapses_with_only_noise() {
        let (mut codec, mut server) = pair().await;
        server.write_all(b"200 NOOP ok\r\n").await.unwrap();
        let sink = LogFacadeSink;
        let mut pending = 0;
        let reply = ReplyReader::new(&mut codec, &sink, false)
            .drain("NOOP", Duration::from_millis(200), &mut pending, true)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(pending, 0);
    }

    #[test]
    fn completion_classification() {
        assert!(expect_completion(Reply::new("226", "ok")).is_ok());
        assert!(expect_completion(Reply::new("150", "opening")).is_err());
        assert!(expect_success(Reply::new("150", "opening")).is_ok());
        let err = expect_success(Reply::new("550", "No such file")).unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotFound);
    }
}
