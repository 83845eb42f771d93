//! # ftp-engine — FTP/FTPS client session engine
//!
//! Protocol coverage:
//! - **RFC 959** — control connection, PASV/PORT, LIST
//! - **RFC 2228 / 4217** — AUTH TLS / FTPS (Explicit & Implicit)
//! - **RFC 2389** — FEAT negotiation
//! - **RFC 2428** — EPSV / EPRT
//! - **RFC 3659** — MLSD/MLST, SIZE, MDTM
//!
//! Architecture:
//! - `types`, `config`, `error`, `logger` — data structures, settings, errors, log sink
//! - `reply` — reply line codec and reply-body parsers (PWD, FEAT, SIZE, MDTM, MLST)
//! - `probe` — non-destructive socket liveness check
//! - `protocol` — line framing over plain or TLS control sockets
//! - `tls` — rustls connector, AUTH TLS upgrade, data-socket wrapping
//! - `reader` — reply reader state machine (collecting and draining)
//! - `state` — per-session state guarded by the command lock
//! - `connection` — connect + login handshake
//! - `executor` — command lock, reconnect, stale-data check, retry
//! - `keepalive`, `liveness` — background daemons
//! - `transfer` — data connection negotiation and `DataStream`
//! - `listing` — dialect detection and LIST/MLSD parsing
//! - `session` — `SessionEngine`, the collaborator-facing handle
//! - `blocking` — synchronous facade

pub mod types;
pub mod config;
pub mod error;
pub mod logger;
pub mod reply;
pub mod probe;
pub mod protocol;
pub mod tls;
pub mod reader;
pub mod state;
pub mod connection;
pub mod executor;
pub mod keepalive;
pub mod liveness;
pub mod transfer;
pub mod listing;
pub mod session;
pub mod blocking;

// Re-exports for lib.rs consumers
pub use types::*;
pub use config::{FtpConnectionConfig, FtpSecurityMode};
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use logger::{FtpLogSink, LogFacadeSink, SharedLogSink};
pub use listing::ListingFormat;
pub use transfer::DataStream;
pub use session::SessionEngine;
pub use blocking::{BlockingDataStream, BlockingSession};
