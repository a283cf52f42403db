//! Bucket store implementations.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use memory::{MemoryBucketStore, DEFAULT_SWEEP_INTERVAL};
pub use redis_store::RedisBucketStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{BucketgateError, Result};
use crate::ratelimit::BucketStore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the store described by `config`. Called once at startup; the
/// returned handle is shared by every check.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn BucketStore>> {
    config.validate()?;

    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-process bucket store");
            Ok(Arc::new(MemoryBucketStore::new()))
        }
        StoreBackend::Redis => {
            let url = config.url.as_deref().ok_or_else(|| {
                BucketgateError::Config("store.url is required for the redis backend".to_string())
            })?;
            // Initial connect gets more slack than a single check.
            let connect_timeout = config.timeout().max(CONNECT_TIMEOUT);
            let store = tokio::time::timeout(
                connect_timeout,
                RedisBucketStore::connect(url, config.key_prefix.clone()),
            )
            .await
            .map_err(|_| BucketgateError::StoreTimeout(connect_timeout))??;
            Ok(Arc::new(store))
        }
    }
}
