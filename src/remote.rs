use crate::config::ShelfConfig;
use crate::error::{ShelfError, ShelfResult};
use crate::store::StoreResult;
use std::future::Future;
use std::time::Duration;

const RETRY_BACKOFF_MS: u64 = 350;

/// Timeout and retry rules applied to every remote call of the core.
///
/// Reads are idempotent and may be retried; writes run exactly once.
#[derive(Debug, Clone, Copy)]
pub struct RemotePolicy {
    timeout: Duration,
    read_retries: u32,
}

impl RemotePolicy {
    pub fn new(timeout: Duration, read_retries: u32) -> Self {
        Self {
            timeout,
            read_retries,
        }
    }

    pub fn from_config(config: &ShelfConfig) -> Self {
        Self::new(config.remote_timeout(), config.read_retries)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn write<T, F>(&self, call: F) -> ShelfResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(ShelfError::from),
            Err(_) => Err(ShelfError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    pub async fn read<T, F, Fut>(&self, mut call: F) -> ShelfResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = self.write(call()).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.read_retries => {
                    attempt += 1;
                    log::warn!("remote read failed (attempt {}): {}", attempt, err);
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RemotePolicy {
    fn default() -> Self {
        Self::from_config(&ShelfConfig::default())
    }
}
