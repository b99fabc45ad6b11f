use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::coalesce::Registry;
use crate::config;

use super::{miss_error, Cache};

/// Embedded KV backend: one sled tree, each value prefixed with its
/// 8-byte big-endian expiration timestamp (unix seconds).
pub struct EmbeddedCache {
    db: sled::Db,
    registry: Arc<Registry>,
    reap_sleep: Duration,
}

impl EmbeddedCache {
    pub fn new(
        cfg: &config::EmbeddedCache,
        reap_sleep: Duration,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let db = sled::open(&cfg.path).with_context(|| format!("open embedded cache {}", cfg.path))?;
        Ok(Self {
            db,
            registry,
            reap_sleep,
        })
    }
}

fn encode_entry(data: &[u8], expires_at: i64) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + data.len());
    value.extend_from_slice(&expires_at.to_be_bytes());
    value.extend_from_slice(data);
    value
}

fn entry_expiration(value: &[u8]) -> Option<i64> {
    let prefix: [u8; 8] = value.get(..8)?.try_into().ok()?;
    Some(i64::from_be_bytes(prefix))
}

#[async_trait]
impl Cache for EmbeddedCache {
    async fn connect(&self) -> Result<()> {
        log::info!("embedded cache setup");
        let db = self.db.clone();
        let registry = Arc::clone(&self.registry);
        let reap_sleep = self.reap_sleep;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(reap_sleep).await;
                let now = crate::context::unix_ms() / 1000;
                let mut expired = Vec::new();
                for item in db.iter() {
                    let Ok((key, value)) = item else { continue };
                    match entry_expiration(&value) {
                        Some(expiration) if expiration >= now => {}
                        _ => expired.push(key),
                    }
                }
                for key in expired {
                    let name = String::from_utf8_lossy(&key).to_string();
                    log::debug!("embedded cache reap key={name}");
                    let _ = db.remove(&key);
                    registry.drop_key(&name).await;
                }
            }
        });
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes, ttl_secs: i64) -> Result<()> {
        log::debug!("embedded cache store key={key}");
        let expires_at = crate::context::unix_ms() / 1000 + ttl_secs;
        self.db
            .insert(key.as_bytes(), encode_entry(&data, expires_at))
            .context("embedded cache insert")?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes> {
        match self.db.get(key.as_bytes()).context("embedded cache get")? {
            Some(value) if value.len() > 8 => Ok(Bytes::copy_from_slice(&value[8..])),
            _ => Err(miss_error(key)),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db
            .remove(key.as_bytes())
            .context("embedded cache remove")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.db.flush().context("embedded cache flush")?;
        Ok(())
    }
}
