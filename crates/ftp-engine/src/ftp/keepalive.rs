//! Keep-alive daemon.
//!
//! Wakes every tick and, when the control connection has been idle for the
//! configured interval, sends a harmless command chosen at random from a
//! pool. It never waits for the command lock: if a foreground command holds
//! it, the tick is skipped.
//!
//! While a data transfer is open the server may not answer until the
//! transfer ends, so the reply is not read; the pending count in the
//! session state tells the foreground to drain it later.

use crate::ftp::executor::SessionShared;
use crate::ftp::reader::ReplyReader;
use crate::ftp::reply::parse_pwd;
use log::Level;
use rand::seq::SliceRandom;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveOutcome {
    /// Interval is zero, the daemon was disabled by a failure, or there is
    /// no connection to keep alive.
    Inactive,
    /// A foreground command holds the lock.
    Busy,
    NotDue,
    /// The command was sent; `awaiting_reply` when its reply was left for
    /// the foreground to drain.
    Sent { command: String, awaiting_reply: bool },
    Failed(String),
}

fn pick_command(pool: &[String]) -> Option<String> {
    let mut rng = rand::thread_rng();
    pool.choose(&mut rng).cloned()
}

/// Run one keep-alive check.
pub async fn tick_once(shared: &SessionShared) -> KeepAliveOutcome {
    let config = &shared.config;
    if config.keepalive_interval_sec == 0 {
        return KeepAliveOutcome::Inactive;
    }
    let Ok(mut guard) = shared.control.try_lock() else {
        return KeepAliveOutcome::Busy;
    };
    let chan = &mut *guard;
    if chan.state.keepalive_disabled || chan.state.needs_reconnect {
        return KeepAliveOutcome::Inactive;
    }
    let Some(codec) = chan.codec.as_mut() else {
        return KeepAliveOutcome::Inactive;
    };
    if chan.state.idle_for() < Duration::from_secs(config.keepalive_interval_sec) {
        return KeepAliveOutcome::NotDue;
    }

    let in_transfer = chan.state.transfer_open;
    let pool = if in_transfer {
        &config.keepalive_transfer_commands
    } else {
        &config.keepalive_idle_commands
    };
    let Some(command) = pick_command(pool) else {
        return KeepAliveOutcome::Inactive;
    };

    let result = if in_transfer {
        shared.log(Level::Trace, &format!(">>> {} (keep-alive, reply deferred)", command));
        codec.send_line(&command).await.map(|_| None)
    } else {
        ReplyReader::new(codec, shared.sink(), config.mask_username)
            .exchange(&command, config.read_timeout())
            .await
            .map(Some)
    };

    match result {
        Ok(reply) => {
            chan.state.touch();
            if in_transfer {
                chan.state.pending_keepalive_replies += 1;
            }
            if let Some(reply) = reply {
                if reply.is_completion() && command.eq_ignore_ascii_case("PWD") {
                    if let Ok(path) = parse_pwd(&reply) {
                        chan.state.directory_known(&path);
                    }
                }
            }
            KeepAliveOutcome::Sent {
                command,
                awaiting_reply: in_transfer,
            }
        }
        Err(e) => {
            shared.log(
                Level::Warn,
                &format!("Keep-alive {} failed, disabling until reconnect: {}", command, e),
            );
            chan.state.keepalive_disabled = true;
            chan.state.needs_reconnect = true;
            KeepAliveOutcome::Failed(e.message)
        }
    }
}

/// Start the daemon. It stops when `shutdown` flips to `true`, when the
/// sender is dropped, or when the session itself is gone.
pub fn spawn(
    shared: Weak<SessionShared>,
    tick: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        log::debug!("Keep-alive daemon shutting down");
                        break;
                    }
                }

                _ = interval.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    tick_once(&shared).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::config::FtpConnectionConfig;
    use crate::ftp::protocol::FtpCodec;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn shared(interval: u64, codec: Option<FtpCodec>) -> SessionShared {
        let mut config = FtpConnectionConfig::new("127.0.0.1", 21);
        config.keepalive_interval_sec = interval;
        config.keepalive_idle_commands = vec!["NOOP".to_string()];
        config.read_timeout_ms = 2_000;
        SessionShared::for_tests(config, codec)
    }

    async fn codec_pair() -> (FtpCodec, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (FtpCodec::from_tcp(client.unwrap()).unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn inactive_without_interval_or_connection() {
        assert_eq!(tick_once(&shared(0, None)).await, KeepAliveOutcome::Inactive);
        assert_eq!(tick_once(&shared(60, None)).await, KeepAliveOutcome::Inactive);
    }

    #[tokio::test]
    async fn skips_when_lock_is_held() {
        let (codec, _server) = codec_pair().await;
        let s = shared(1, Some(codec));
        let _held = s.control.lock().await;
        assert_eq!(tick_once(&s).await, KeepAliveOutcome::Busy);
    }

    #[tokio::test]
    async fn not_due_after_recent_command() {
        let (codec, _server) = codec_pair().await;
        let s = shared(60, Some(codec));
        assert_eq!(tick_once(&s).await, KeepAliveOutcome::NotDue);
    }

    #[tokio::test]
    async fn sends_when_idle() {
        let (codec, server) = codec_pair().await;
        let s = shared(1, Some(codec));
        s.control.lock().await.state.last_command_time = tokio::time::Instant::now() - Duration::from_secs(2);

        let responder = tokio::spawn(async move {
            let (rd, mut wr) = server.into_split();
            let mut lines = BufReader::new(rd).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            wr.write_all(b"200 NOOP ok\r\n").await.unwrap();
            line
        });

        let outcome = tick_once(&s).await;
        assert_eq!(
            outcome,
            KeepAliveOutcome::Sent {
                command: "NOOP".to_string(),
                awaiting_reply: false
            }
        );
        assert_eq!(responder.await.unwrap(), "NOOP");
        assert!(s.control.lock().await.state.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn transfer_defers_reply() {
        let (codec, _server) = codec_pair().await;
        let s = shared(1, Some(codec));
        {
            let mut chan = s.control.lock().await;
            chan.state.transfer_open = true;
            chan.state.last_command_time = tokio::time::Instant::now() - Duration::from_secs(2);
        }
        let outcome = tick_once(&s).await;
        assert!(matches!(outcome, KeepAliveOutcome::Sent { awaiting_reply: true, .. }));
        assert_eq!(s.control.lock().await.state.pending_keepalive_replies, 1);
    }

    #[tokio::test]
    async fn failure_disables_until_reconnect() {
        let (codec, server) = codec_pair().await;
        drop(server);
        let s = shared(1, Some(codec));
        s.control.lock().await.state.last_command_time = tokio::time::Instant::now() - Duration::from_secs(2);

        let outcome = tick_once(&s).await;
        assert!(matches!(outcome, KeepAliveOutcome::Failed(_)), "{:?}", outcome);
        {
            let chan = s.control.lock().await;
            assert!(chan.state.keepalive_disabled);
            assert!(chan.state.needs_reconnect);
            assert!(!chan.is_connected());
        }
        assert_eq!(tick_once(&s).await, KeepAliveOutcome::Inactive);
    }

    #[test]
    fn picks_from_pool() {
        let pool = vec!["NOOP".to_string(), "PWD".to_string()];
        for _ in 0..20 {
            let cmd = pick_command(&pool).unwrap();
            assert!(cmd == "NOOP" || cmd == "PWD");
        }
        assert!(pick_command(&[]).is_none());
    }
}
