//! Dialing the real Docker daemon's Unix socket, with retry/backoff
//! for the startup window where the socket isn't listening yet.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use trustproxy_fs::{Dialer, ReadWrite};
use trustproxy_retry::{RetryExecutor, RetryStrategyConfig};

pub struct UnixDialer {
    socket_path: PathBuf,
    retry: RetryStrategyConfig,
}

impl UnixDialer {
    pub fn new(socket_path: PathBuf, retry: RetryStrategyConfig) -> Self {
        Self { socket_path, retry }
    }
}

impl Dialer for UnixDialer {
    fn dial(&self) -> Result<Box<dyn ReadWrite>> {
        let executor = RetryExecutor::new(self.retry.clone());
        let stream = executor
            .run(|_attempt| UnixStream::connect(&self.socket_path))
            .with_context(|| format!("docker: failed to dial daemon socket {}", self.socket_path.display()))?;
        Ok(Box::new(stream))
    }
}
