//! FTP/FTPS client session engine.
//!
//! See [`ftp`] for the module map; the usual entry point is
//! [`ftp::SessionEngine`].

pub mod ftp;
