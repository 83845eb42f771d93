//! Logging sink handed to the engine by its collaborators.
//!
//! The engine reports every command, reply and status transition through
//! an [`FtpLogSink`]. The default sink forwards to the `log` facade.

use log::Level;
use std::sync::Arc;

/// Receives engine log lines. Implementations must be cheap and must not
/// call back into the session.
pub trait FtpLogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Forwards to the `log` crate under the `ftp_engine` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFacadeSink;

impl FtpLogSink for LogFacadeSink {
    fn log(&self, level: Level, message: &str) {
        log::log!(target: "ftp_engine", level, "{}", message);
    }
}

pub type SharedLogSink = Arc<dyn FtpLogSink>;

pub fn default_sink() -> SharedLogSink {
    Arc::new(LogFacadeSink)
}

/// Replace credentials in a command line before it is logged or stored in
/// a reply. The wire keeps the real value.
pub fn mask_command(cmd: &str, mask_username: bool) -> String {
    let upper = cmd.trim_start().to_uppercase();
    if upper.starts_with("PASS ") || upper == "PASS" {
        "PASS ****".to_string()
    } else if mask_username && (upper.starts_with("USER ") || upper == "USER") {
        "USER ****".to_string()
    } else if upper.starts_with("ACCT ") {
        "ACCT ****".to_string()
    } else {
        cmd.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_password_always_and_user_on_request() {
        assert_eq!(mask_command("PASS hunter2", false), "PASS ****");
        assert_eq!(mask_command("pass hunter2", false), "PASS ****");
        assert_eq!(mask_command("USER bob", false), "USER bob");
        assert_eq!(mask_command("USER bob", true), "USER ****");
        assert_eq!(mask_command("CWD /pub", true), "CWD /pub");
    }
}
