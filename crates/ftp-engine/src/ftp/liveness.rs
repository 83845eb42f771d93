//! Liveness daemon.
//!
//! Probes the control socket and any open data socket once each has been
//! idle for its interval. A socket that has been closed by the peer is shut
//! down locally so that whoever is blocked on it fails fast; the control
//! connection is then rebuilt by the next foreground command.
//!
//! The control probe uses `try_lock`: a foreground command holding the
//! lock is proof enough that the socket is in use.

use crate::ftp::executor::SessionShared;
use crate::ftp::probe::{Liveness, SocketProbe};
use log::Level;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Registration of an open data socket.
#[derive(Debug)]
pub struct DataSocketWatch {
    pub probe: SocketProbe,
    /// Updated by the data stream on every successful read or write.
    pub last_activity: Arc<StdMutex<Instant>>,
    pub last_probe: Option<Instant>,
}

impl DataSocketWatch {
    pub fn new(probe: SocketProbe, last_activity: Arc<StdMutex<Instant>>) -> Self {
        Self {
            probe,
            last_activity,
            last_probe: None,
        }
    }

    fn idle_for(&self) -> Duration {
        let activity = self
            .last_activity
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Instant::now());
        let since = match self.last_probe {
            Some(p) if p > activity => p,
            _ => activity,
        };
        since.elapsed()
    }
}

/// Result of one daemon pass. `None` means the socket was not probed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub control: Option<Liveness>,
    pub data: Option<Liveness>,
}

/// Daemon-local schedule for the control probe.
#[derive(Debug, Default)]
pub struct LivenessSchedule {
    last_control_probe: Option<Instant>,
}

pub async fn tick_once(shared: &SessionShared, schedule: &mut LivenessSchedule) -> LivenessReport {
    let mut report = LivenessReport::default();
    let config = &shared.config;

    if config.liveness_control_interval_sec > 0 {
        let interval = Duration::from_secs(config.liveness_control_interval_sec);
        if let Ok(mut guard) = shared.control.try_lock() {
            let chan = &mut *guard;
            let since_probe = schedule
                .last_control_probe
                .map(|p| p.elapsed())
                .unwrap_or(Duration::MAX);
            if let Some(codec) = chan.codec.as_mut() {
                if chan.state.idle_for() >= interval && since_probe >= interval {
                    schedule.last_control_probe = Some(Instant::now());
                    let status = codec.probe().check();
                    if let Liveness::Dead(reason) = &status {
                        shared.log(
                            Level::Warn,
                            &format!("Control connection to {} is dead: {}", config.host, reason),
                        );
                        codec.probe().close();
                        chan.codec = None;
                        chan.state.connection_lost();
                    }
                    report.control = Some(status);
                }
            }
        }
    }

    if config.liveness_data_interval_sec > 0 {
        let interval = Duration::from_secs(config.liveness_data_interval_sec);
        if let Ok(mut watch) = shared.data_watch.lock() {
            if let Some(w) = watch.as_mut() {
                if w.idle_for() >= interval {
                    w.last_probe = Some(Instant::now());
                    let status = w.probe.check();
                    if let Liveness::Dead(reason) = &status {
                        shared.log(
                            Level::Warn,
                            &format!("Data connection is dead, closing it: {}", reason),
                        );
                        w.probe.close();
                        *watch = None;
                    }
                    report.data = Some(status);
                }
            }
        }
    }

    report
}

/// Start the daemon; same shutdown contract as the keep-alive daemon.
pub fn spawn(
    shared: Weak<SessionShared>,
    tick: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut schedule = LivenessSchedule::default();
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        log::debug!("Liveness daemon shutting down");
                        break;
                    }
                }

                _ = interval.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    tick_once(&shared, &mut schedule).await;
                }
            }
        }
    })
}
