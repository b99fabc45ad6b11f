use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::coalesce::Registry;
use crate::config;
use crate::timeseries::MatrixEnvelope;

pub mod embedded;
pub mod filesystem;
pub mod memory;
pub mod redis;

/// Key/value byte storage with per-entry TTL. A missed retrieve is an
/// error. Backends with local expiry run a background reap that also
/// tells the coalescer registry to drop per-key worker state, so a
/// request arriving after expiry starts a fresh cycle.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn store(&self, key: &str, data: Bytes, ttl_secs: i64) -> Result<()>;
    async fn retrieve(&self, key: &str) -> Result<Bytes>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub fn create(cfg: &config::Caching, registry: Arc<Registry>) -> Result<Arc<dyn Cache>> {
    match cfg.cache_type.as_str() {
        "" | "memory" => Ok(Arc::new(memory::MemoryCache::new(cfg.reap_sleep(), registry))),
        "filesystem" => Ok(Arc::new(filesystem::FilesystemCache::new(
            &cfg.filesystem,
            cfg.reap_sleep(),
            registry,
        ))),
        "embedded" => Ok(Arc::new(embedded::EmbeddedCache::new(
            &cfg.embedded,
            cfg.reap_sleep(),
            registry,
        )?)),
        "redis" => Ok(Arc::new(redis::RedisCache::new(&cfg.redis))),
        other => Err(anyhow!("unknown cache_type {other:?}")),
    }
}

pub(crate) fn miss_error(key: &str) -> anyhow::Error {
    anyhow!("value for key [{key}] not in cache")
}

/// Serializes a result set for storage, optionally compressed.
pub fn encode_payload(matrix: &MatrixEnvelope, compress: bool) -> Result<Bytes> {
    let json = serde_json::to_vec(matrix)?;
    if compress {
        let packed = zstd::encode_all(json.as_slice(), 0)?;
        Ok(Bytes::from(packed))
    } else {
        Ok(Bytes::from(json))
    }
}

/// Deserializes a stored payload. Compression is detected by sniffing:
/// anything not starting with the JSON object-open byte is treated as
/// compressed, so the compression setting can change across restarts
/// without invalidating existing entries.
pub fn decode_payload(raw: &[u8]) -> Result<MatrixEnvelope> {
    if raw.is_empty() {
        return Err(anyhow!("empty cache payload"));
    }
    if raw[0] == b'{' {
        return Ok(serde_json::from_slice(raw)?);
    }
    let unpacked = zstd::decode_all(raw)?;
    Ok(serde_json::from_slice(&unpacked)?)
}
