use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

use crate::cache::{self, Cache};
use crate::config::Origin;
use crate::delta::{self, CacheLookup, Resolution};
use crate::timeseries::{Extent, MatrixEnvelope};

// Client URL parameter names, matching the upstream API.
pub const UP_QUERY: &str = "query";
pub const UP_START: &str = "start";
pub const UP_END: &str = "end";
pub const UP_STEP: &str = "step";
pub const UP_TIME: &str = "time";
pub const UP_TIMEOUT: &str = "timeout";
pub const UP_ORIGIN: &str = "origin";

/// The immutable ingredients of one client request, kept so the
/// coalescer worker can rebuild a fresh context against current cache
/// state after dequeueing.
#[derive(Clone)]
pub struct RequestShape {
    pub origin: Origin,
    pub params: HashMap<String, String>,
    pub authorization: Option<String>,
    pub no_cache: bool,
}

impl RequestShape {
    /// Whether the no-cache directive is honored for this origin.
    pub fn bypass(&self) -> bool {
        self.no_cache && !self.origin.ignore_no_cache_header
    }
}

/// Per-request working state: the classification, the fetch extents,
/// and the dataset being assembled. Built fresh on every resolve pass.
pub struct RequestContext {
    pub origin: Origin,
    pub params: HashMap<String, String>,
    pub authorization: Option<String>,
    pub step_param: String,
    pub step_ms: i64,
    pub cache_key: String,
    pub request: Extent,
    pub lookup: CacheLookup,
    pub lower: Option<Extent>,
    pub upper: Option<Extent>,
    pub matrix: MatrixEnvelope,
    pub now_ms: i64,
}

impl RequestContext {
    /// Fast-forward applies only to requests whose window reaches the
    /// present (within one step).
    pub fn wants_fast_forward(&self) -> bool {
        !self.origin.fast_forward_disable && self.request.end >= self.now_ms - self.step_ms
    }
}

/// Errors from context building, split by who is at fault.
#[derive(Debug)]
pub enum ContextError {
    BadRequest(anyhow::Error),
    Internal(anyhow::Error),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::BadRequest(err) => write!(f, "{err}"),
            ContextError::Internal(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ContextError {}

pub fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Builds the request context: validates and normalizes parameters,
/// derives the cache key, reads the cache, and classifies coverage.
pub async fn build(
    shape: &RequestShape,
    cache: &Arc<dyn Cache>,
) -> Result<RequestContext, ContextError> {
    let now_ms = unix_ms();

    let step_param = shape
        .params
        .get(UP_STEP)
        .cloned()
        .ok_or_else(|| ContextError::BadRequest(anyhow!("missing step parameter")))?;
    let step_ms = parse_duration(&step_param)
        .map_err(ContextError::BadRequest)?;
    if step_ms <= 0 {
        return Err(ContextError::BadRequest(anyhow!(
            "step parameter {step_param} <= 0, has to be positive"
        )));
    }

    let start_param = shape
        .params
        .get(UP_START)
        .ok_or_else(|| ContextError::BadRequest(anyhow!("missing start time parameter")))?;
    let start_ms = parse_time(start_param).map_err(ContextError::BadRequest)?;

    let end_param = shape
        .params
        .get(UP_END)
        .ok_or_else(|| ContextError::BadRequest(anyhow!("missing end time parameter")))?;
    let end_ms = parse_time(end_param).map_err(ContextError::BadRequest)?;

    let (start_ms, end_ms) = delta::align_step_boundaries(start_ms, end_ms, step_ms, now_ms)
        .map_err(ContextError::BadRequest)?;
    let request = Extent::new(start_ms, end_ms);

    // The key identifies the query shape; the step keeps datasets with
    // different resolutions apart, the principal keeps authorized
    // datasets from leaking across users.
    let mut key_base = format!("{}{}", shape.origin.api_base(), step_param);
    if let Some(auth) = &shape.authorization {
        key_base.push_str(auth);
    }
    let cache_key = derive_cache_key(&key_base, &shape.params);

    let bypass = shape.bypass();
    let mut cached = None;
    let mut decode_failed = false;
    if !bypass {
        if let Ok(raw) = cache.retrieve(&cache_key).await {
            match cache::decode_payload(&raw) {
                Ok(matrix) => cached = Some(matrix),
                Err(err) => {
                    // Treat an undecodable entry as missing; the
                    // write-back after this cycle replaces it.
                    log::warn!("cache payload decode failed cacheKey={cache_key} detail={err}");
                    decode_failed = true;
                }
            }
        }
    }

    let resolution = if decode_failed {
        Resolution {
            lookup: CacheLookup::RangeMiss,
            lower: None,
            upper: Some(request),
        }
    } else {
        delta::resolve(request, step_ms, cached.as_ref(), bypass)
            .map_err(ContextError::Internal)?
    };

    let matrix = match (&resolution.lookup, cached) {
        (CacheLookup::Purge, _) | (_, None) => MatrixEnvelope::empty(),
        (_, Some(matrix)) => matrix,
    };

    log::debug!(
        "deltaRoutineCompleted cacheLookupResult={} cacheKey={} reqStart={} reqEnd={} lower={:?} upper={:?}",
        resolution.lookup.as_str(),
        cache_key,
        request.start,
        request.end,
        resolution.lower,
        resolution.upper,
    );

    Ok(RequestContext {
        origin: shape.origin.clone(),
        params: shape.params.clone(),
        authorization: shape.authorization.clone(),
        step_param,
        step_ms,
        cache_key,
        request,
        lookup: resolution.lookup,
        lower: resolution.lower,
        upper: resolution.upper,
        matrix,
        now_ms,
    })
}

fn md5hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Content-hash key for a query shape: origin identity on the left,
/// query text (and instant timestamp when present) on the right. The
/// requested window never participates.
pub fn derive_cache_key(prefix: &str, params: &HashMap<String, String>) -> String {
    let mut key = String::new();
    if !prefix.is_empty() {
        key = md5hex(prefix);
    }
    if let Some(query) = params.get(UP_QUERY) {
        key.push('.');
        key.push_str(&md5hex(query));
    }
    if let Some(time) = params.get(UP_TIME) {
        key.push('.');
        key.push_str(&md5hex(time));
    }
    key
}

/// Parses a time parameter: Unix seconds with optional fraction, or
/// RFC3339. Returns epoch milliseconds.
pub fn parse_time(s: &str) -> Result<i64> {
    if let Ok(secs) = s.parse::<f64>() {
        return Ok((secs * 1000.0).round() as i64);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    Err(anyhow!("cannot parse {s:?} to a valid timestamp"))
}

/// Parses a step parameter: plain seconds with optional fraction, or a
/// short duration like `5m`. Returns milliseconds.
pub fn parse_duration(s: &str) -> Result<i64> {
    if let Ok(secs) = s.parse::<f64>() {
        let ms = secs * 1000.0;
        if !ms.is_finite() || ms > i64::MAX as f64 || ms < i64::MIN as f64 {
            return Err(anyhow!("cannot parse {s:?} to a valid duration, it overflows"));
        }
        return Ok(ms.round() as i64);
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("cannot parse {s:?} to a valid duration"))?;
    let (num, unit) = s.split_at(split);
    let n: i64 = num
        .parse()
        .map_err(|_| anyhow!("cannot parse {s:?} to a valid duration"))?;
    let unit_ms = match unit {
        "ms" => 1,
        "s" => 1000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        "y" => 31_536_000_000,
        _ => return Err(anyhow!("cannot parse {s:?} to a valid duration")),
    };
    n.checked_mul(unit_ms)
        .ok_or_else(|| anyhow!("cannot parse {s:?} to a valid duration, it overflows"))
}

/// Splits a raw query string into decoded parameters, first value
/// winning for repeated names.
pub fn parse_query_params(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(k))
            .or_insert_with(|| decode_component(v));
    }
    params
}

fn decode_component(s: &str) -> String {
    let plussed = s.replace('+', " ");
    match urlencoding::decode(&plussed) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => plussed,
    }
}
