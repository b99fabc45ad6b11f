use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::coalesce::Registry;
use crate::config;

use super::{miss_error, Cache};

const DATA_SUFFIX: &str = "data";
const EXPIRATION_SUFFIX: &str = "expiration";

/// On-disk backend: each entry is a `<key>.data` / `<key>.expiration`
/// file pair under the configured cache path. Keys are hex hashes, so
/// they are safe as file names.
pub struct FilesystemCache {
    cache_path: PathBuf,
    mutexes: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    registry: Arc<Registry>,
    reap_sleep: Duration,
}

impl FilesystemCache {
    pub fn new(
        cfg: &config::FilesystemCache,
        reap_sleep: Duration,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            cache_path: PathBuf::from(&cfg.cache_path),
            mutexes: Arc::new(StdMutex::new(HashMap::new())),
            registry,
            reap_sleep,
        }
    }

    fn file_names(&self, key: &str) -> (PathBuf, PathBuf) {
        (
            self.cache_path.join(format!("{key}.{EXPIRATION_SUFFIX}")),
            self.cache_path.join(format!("{key}.{DATA_SUFFIX}")),
        )
    }

    fn key_mutex(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.mutexes.lock().expect("filesystem cache mutexes");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn connect(&self) -> Result<()> {
        log::info!(
            "filesystem cache setup cachePath={}",
            self.cache_path.display()
        );
        std::fs::create_dir_all(&self.cache_path).with_context(|| {
            format!("create cache directory {}", self.cache_path.display())
        })?;

        let cache_path = self.cache_path.clone();
        let mutexes = Arc::clone(&self.mutexes);
        let registry = Arc::clone(&self.registry);
        let reap_sleep = self.reap_sleep;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(reap_sleep).await;
                reap(&cache_path, &mutexes, &registry).await;
            }
        });
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes, ttl_secs: i64) -> Result<()> {
        let (exp_file, data_file) = self.file_names(key);
        let expiration = (crate::context::unix_ms() / 1000 + ttl_secs).to_string();
        log::debug!(
            "filesystem cache store key={key} dataFile={}",
            data_file.display()
        );
        let mutex = self.key_mutex(key);
        let _guard = mutex.lock().await;
        std::fs::write(&data_file, &data)
            .with_context(|| format!("write {}", data_file.display()))?;
        std::fs::write(&exp_file, expiration)
            .with_context(|| format!("write {}", exp_file.display()))?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes> {
        let (_, data_file) = self.file_names(key);
        log::debug!(
            "filesystem cache retrieve key={key} dataFile={}",
            data_file.display()
        );
        let mutex = self.key_mutex(key);
        let _guard = mutex.lock().await;
        match std::fs::read(&data_file) {
            Ok(content) => Ok(Bytes::from(content)),
            Err(_) => Err(miss_error(key)),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let (exp_file, data_file) = self.file_names(key);
        let mutex = self.key_mutex(key);
        let _guard = mutex.lock().await;
        let _ = std::fs::remove_file(&exp_file);
        let _ = std::fs::remove_file(&data_file);
        Ok(())
    }
}

/// One pass over the cache directory: any entry whose expiration file
/// is past due (or unreadable) is deleted, and its per-key worker
/// state is dropped from the coalescer registry.
async fn reap(
    cache_path: &Path,
    mutexes: &Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    registry: &Arc<Registry>,
) {
    let now = crate::context::unix_ms() / 1000;
    let entries = match std::fs::read_dir(cache_path) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        let Some(key) = name.strip_suffix(&format!(".{EXPIRATION_SUFFIX}")) else {
            continue;
        };
        let key = key.to_string();
        let exp_file = cache_path.join(&name);
        let data_file = cache_path.join(format!("{key}.{DATA_SUFFIX}"));

        let mutex = {
            let mut map = mutexes.lock().expect("filesystem cache mutexes");
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = mutex.lock().await;

        let expired = match std::fs::read_to_string(&exp_file) {
            Ok(content) => content
                .trim()
                .parse::<i64>()
                .map(|expiration| expiration < now)
                .unwrap_or(true),
            Err(_) => continue,
        };
        if expired {
            log::debug!(
                "filesystem cache reap key={key} dataFile={}",
                data_file.display()
            );
            let _ = std::fs::remove_file(&exp_file);
            let _ = std::fs::remove_file(&data_file);
            registry.drop_key(&key).await;
        }
    }
}
