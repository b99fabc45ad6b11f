use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_RECORD_TTL_SECS: i64 = 21600;
pub const DEFAULT_REAP_SLEEP_MS: u64 = 1000;
pub const DEFAULT_MAX_VALUE_AGE_SECS: i64 = 86400;
pub const DEFAULT_API_PATH: &str = "/api/v1/";

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub caching: Caching,
    #[serde(default)]
    pub origins: HashMap<String, Origin>,
    #[serde(default)]
    pub default_origin_url: Option<String>,
    #[serde(default)]
    pub upstream: Upstream,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.origins.is_empty() && self.default_origin_url.is_none() {
            return Err(anyhow!("at least one origin or default_origin_url is required"));
        }
        for (name, origin) in &self.origins {
            if origin.origin_url.trim().is_empty() {
                return Err(anyhow!("origins.{name}.origin_url is required"));
            }
        }
        Ok(())
    }

    /// Resolves the origin config for a moniker, `origin` param, or
    /// Host header value, falling back to the `default` entry.
    pub fn origin(&self, name: &str) -> Origin {
        if let Some(origin) = self.origins.get(name) {
            return origin.clone();
        }
        let mut origin = self
            .origins
            .get("default")
            .cloned()
            .unwrap_or_default();
        if let Some(url) = &self.default_origin_url {
            origin.origin_url = url.clone();
        }
        origin
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Caching {
    /// One of "memory", "filesystem", "embedded", "redis".
    #[serde(default)]
    pub cache_type: String,
    #[serde(default)]
    pub record_ttl_secs: i64,
    #[serde(default)]
    pub reap_sleep_ms: u64,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default)]
    pub filesystem: FilesystemCache,
    #[serde(default)]
    pub embedded: EmbeddedCache,
    #[serde(default)]
    pub redis: RedisCache,
}

impl Caching {
    pub fn record_ttl_secs(&self) -> i64 {
        if self.record_ttl_secs > 0 {
            self.record_ttl_secs
        } else {
            DEFAULT_RECORD_TTL_SECS
        }
    }

    pub fn reap_sleep(&self) -> Duration {
        let ms = if self.reap_sleep_ms > 0 {
            self.reap_sleep_ms
        } else {
            DEFAULT_REAP_SLEEP_MS
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilesystemCache {
    #[serde(default)]
    pub cache_path: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmbeddedCache {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisCache {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Origin {
    #[serde(default)]
    pub origin_url: String,
    #[serde(default = "default_api_path")]
    pub api_path: String,
    #[serde(default = "default_true")]
    pub ignore_no_cache_header: bool,
    #[serde(default = "default_max_value_age")]
    pub max_value_age_secs: i64,
    #[serde(default)]
    pub fast_forward_disable: bool,
    /// Backfill tolerance: data newer than now minus this many seconds
    /// is served but never written back to cache.
    #[serde(default)]
    pub no_cache_last_data_secs: i64,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            origin_url: String::new(),
            api_path: DEFAULT_API_PATH.to_string(),
            ignore_no_cache_header: true,
            max_value_age_secs: DEFAULT_MAX_VALUE_AGE_SECS,
            fast_forward_disable: false,
            no_cache_last_data_secs: 0,
        }
    }
}

impl Origin {
    /// The effective base URL for API calls: origin_url joined with
    /// the API path, normalized to a single trailing slash.
    pub fn api_base(&self) -> String {
        let base = self.origin_url.trim_end_matches('/');
        let path = self.api_path.trim_matches('/');
        if path.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{path}/")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub max_idle_conns: usize,
    #[serde(default)]
    pub max_idle_conns_per_host: usize,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            max_idle_conns: 0,
            max_idle_conns_per_host: 0,
            insecure_skip_verify: false,
        }
    }
}

impl Upstream {
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            self.timeout
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_path() -> String {
    DEFAULT_API_PATH.to_string()
}

fn default_max_value_age() -> i64 {
    DEFAULT_MAX_VALUE_AGE_SECS
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
