use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::coalesce::Registry;

use super::{miss_error, Cache};

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    expires_at: i64,
}

pub struct MemoryCache {
    map: Arc<RwLock<HashMap<String, Entry>>>,
    registry: Arc<Registry>,
    reap_sleep: Duration,
}

impl MemoryCache {
    pub fn new(reap_sleep: Duration, registry: Arc<Registry>) -> Self {
        Self {
            map: Arc::new(RwLock::new(HashMap::new())),
            registry,
            reap_sleep,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn connect(&self) -> Result<()> {
        log::info!("memory cache setup");
        let map = Arc::clone(&self.map);
        let registry = Arc::clone(&self.registry);
        let reap_sleep = self.reap_sleep;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(reap_sleep).await;
                let now = crate::context::unix_ms() / 1000;
                let expired: Vec<String> = {
                    let map = map.read().await;
                    map.iter()
                        .filter(|(_, entry)| entry.expires_at < now)
                        .map(|(key, _)| key.clone())
                        .collect()
                };
                for key in expired {
                    log::debug!("memory cache reap key={key}");
                    map.write().await.remove(&key);
                    registry.drop_key(&key).await;
                }
            }
        });
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes, ttl_secs: i64) -> Result<()> {
        log::debug!("memory cache store key={key}");
        let entry = Entry {
            data,
            expires_at: crate::context::unix_ms() / 1000 + ttl_secs,
        };
        self.map.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes> {
        let map = self.map.read().await;
        map.get(key)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| miss_error(key))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.write().await.remove(key);
        Ok(())
    }
}
