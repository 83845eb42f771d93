//! Blocking facade over [`SessionEngine`] for callers without a runtime.
//!
//! The session owns a small multi-thread runtime; its worker keeps the
//! daemons running between calls. Do not use from inside another tokio
//! runtime: `block_on` panics there.

use crate::ftp::config::FtpConnectionConfig;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::logger::{default_sink, SharedLogSink};
use crate::ftp::session::SessionEngine;
use crate::ftp::transfer::DataStream;
use crate::ftp::types::{
    CapabilitySet, DataType, FtpListing, ListEntry, ListOptions, Reply, SessionInfo, TransferDirection,
};
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;

fn build_runtime() -> FtpResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("ftp-engine")
        .enable_all()
        .build()
        .map_err(|e| FtpError::io_error(format!("Cannot start runtime: {}", e)))
}

pub struct BlockingSession {
    engine: SessionEngine,
    runtime: Arc<Runtime>,
}

impl BlockingSession {
    pub fn new(config: FtpConnectionConfig) -> FtpResult<Self> {
        Self::with_log_sink(config, default_sink())
    }

    pub fn with_log_sink(config: FtpConnectionConfig, sink: SharedLogSink) -> FtpResult<Self> {
        let runtime = Arc::new(build_runtime()?);
        // The TLS connector and daemons expect a runtime context.
        let engine = {
            let _guard = runtime.enter();
            SessionEngine::with_log_sink(config, sink)?
        };
        Ok(Self { engine, runtime })
    }

    /// The async engine behind this facade.
    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    pub fn connect(&self) -> FtpResult<SessionInfo> {
        self.runtime.block_on(self.engine.connect())
    }

    pub fn disconnect(&self) -> FtpResult<()> {
        self.runtime.block_on(self.engine.disconnect())
    }

    pub fn execute(&self, cmd: &str) -> FtpResult<Reply> {
        self.runtime.block_on(self.engine.execute(cmd))
    }

    pub fn get_capabilities(&self) -> FtpResult<Arc<CapabilitySet>> {
        self.runtime.block_on(self.engine.get_capabilities())
    }

    pub fn set_capabilities(&self, caps: CapabilitySet) {
        self.runtime.block_on(self.engine.set_capabilities(caps))
    }

    pub fn get_listing(&self, path: &str, options: &ListOptions) -> FtpResult<FtpListing> {
        self.runtime.block_on(self.engine.get_listing(path, options))
    }

    pub fn get_working_directory(&self) -> FtpResult<String> {
        self.runtime.block_on(self.engine.get_working_directory())
    }

    pub fn set_working_directory(&self, path: &str) -> FtpResult<()> {
        self.runtime.block_on(self.engine.set_working_directory(path))
    }

    pub fn set_data_type(&self, data_type: DataType) -> FtpResult<()> {
        self.runtime.block_on(self.engine.set_data_type(data_type))
    }

    pub fn get_file_size(&self, path: &str) -> FtpResult<i64> {
        self.runtime.block_on(self.engine.get_file_size(path))
    }

    pub fn get_modified_time(&self, path: &str) -> FtpResult<DateTime<Utc>> {
        self.runtime.block_on(self.engine.get_modified_time(path))
    }

    pub fn get_object_info(&self, path: &str) -> FtpResult<ListEntry> {
        self.runtime.block_on(self.engine.get_object_info(path))
    }

    pub fn session_info(&self) -> SessionInfo {
        self.runtime.block_on(self.engine.session_info())
    }

    pub fn open_data_connection(
        &self,
        direction: TransferDirection,
        data_type: DataType,
        command: &str,
    ) -> FtpResult<BlockingDataStream> {
        let stream = self
            .runtime
            .block_on(self.engine.open_data_connection(direction, data_type, command))?;
        Ok(self.wrap(stream))
    }

    pub fn open_data_connection_on_sibling(
        &self,
        direction: TransferDirection,
        data_type: DataType,
        command: &str,
    ) -> FtpResult<BlockingDataStream> {
        let stream = self.runtime.block_on(
            self.engine
                .open_data_connection_on_sibling(direction, data_type, command),
        )?;
        Ok(self.wrap(stream))
    }

    fn wrap(&self, stream: DataStream) -> BlockingDataStream {
        BlockingDataStream {
            inner: Some(stream),
            runtime: self.runtime.clone(),
        }
    }
}

/// A data connection usable with `std::io`.
pub struct BlockingDataStream {
    inner: Option<DataStream>,
    runtime: Arc<Runtime>,
}

impl BlockingDataStream {
    fn stream(&mut self) -> io::Result<&mut DataStream> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "data stream already finished"))
    }

    /// Close the socket and return the transfer's final reply.
    pub fn finish(mut self) -> FtpResult<Reply> {
        let stream = self
            .inner
            .take()
            .ok_or_else(|| FtpError::data_channel("Data stream already finished"))?;
        self.runtime.block_on(stream.finish())
    }
}

impl Read for BlockingDataStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let runtime = self.runtime.clone();
        let stream = self.stream()?;
        runtime.block_on(stream.read(buf))
    }
}

impl Write for BlockingDataStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let runtime = self.runtime.clone();
        let stream = self.stream()?;
        runtime.block_on(stream.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let runtime = self.runtime.clone();
        let stream = self.stream()?;
        runtime.block_on(stream.flush())
    }
}

impl Drop for BlockingDataStream {
    fn drop(&mut self) {
        // An unfinished stream schedules its cleanup on the runtime.
        if let Some(stream) = self.inner.take() {
            let _guard = self.runtime.enter();
            drop(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_quit_and_info() {
        let session = BlockingSession::new(FtpConnectionConfig::new("127.0.0.1", 1)).unwrap();
        let reply = session.execute("QUIT").unwrap();
        assert_eq!(reply.code, "221");
        assert!(!session.session_info().connected);
        session.disconnect().unwrap();
    }

    #[test]
    fn connect_failure_is_reported() {
        let mut config = FtpConnectionConfig::new("127.0.0.1", 1);
        config.connect_timeout_sec = 1;
        let session = BlockingSession::new(config).unwrap();
        assert!(session.connect().is_err());
    }
}
