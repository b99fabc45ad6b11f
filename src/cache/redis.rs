use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use crate::config;

use super::{miss_error, Cache};

/// External KV backend. Expiration rides on the server's native TTL,
/// so there is no local reap loop; a request after expiry simply takes
/// the key-miss path.
pub struct RedisCache {
    cfg: config::RedisCache,
    conn: OnceCell<ConnectionManager>,
}

impl RedisCache {
    pub fn new(cfg: &config::RedisCache) -> Self {
        Self {
            cfg: cfg.clone(),
            conn: OnceCell::new(),
        }
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("redis cache not connected"))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn connect(&self) -> Result<()> {
        let url = match &self.cfg.password {
            Some(password) => format!("redis://:{password}@{}", self.cfg.endpoint),
            None => format!("redis://{}", self.cfg.endpoint),
        };
        log::info!("redis cache setup endpoint={}", self.cfg.endpoint);
        let client = redis::Client::open(url).context("redis client")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("redis connect")?;
        let _ = self.conn.set(manager);
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes, ttl_secs: i64) -> Result<()> {
        log::debug!("redis cache store key={key}");
        let mut conn = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(data.as_ref())
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .context("redis set")?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Bytes> {
        let mut conn = self.connection()?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis get")?;
        value.map(Bytes::from).ok_or_else(|| miss_error(key))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis del")?;
        Ok(())
    }
}
