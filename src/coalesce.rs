use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::cache::{self, Cache};
use crate::config::Bootstrap;
use crate::context::{self, ContextError, RequestContext, RequestShape};
use crate::delta::CacheLookup;
use crate::fetch;
use crate::metrics;
use crate::timeseries::{merge_matrix, merge_vector, MatrixEnvelope};
use crate::upstream::UpstreamClient;

const QUEUE_CAPACITY: usize = 100;
const IDLE_POLL: Duration = Duration::from_secs(10);
const MN_QUERY_RANGE: &str = "query_range";

/// The final answer delivered to a waiting request task.
pub struct HandlerResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HandlerResponse {
    pub fn new(status: StatusCode, body: Bytes) -> Self {
        Self { status, body }
    }

    fn bad_gateway() -> Self {
        Self::new(StatusCode::BAD_GATEWAY, Bytes::new())
    }

    fn internal_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
    }
}

/// One queued range request: the ingredients to rebuild its context
/// plus the one-shot completion signal its handler task is blocked on.
pub struct QueuedRequest {
    pub shape: RequestShape,
    pub done: oneshot::Sender<HandlerResponse>,
}

/// The per-cache-key worker registry. This single lock also serializes
/// against the cache reapers, which drop a key's entry here when its
/// record expires so the next request starts a fresh worker.
pub struct Registry {
    inner: Mutex<HashMap<String, mpsc::Sender<QueuedRequest>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn drop_key(&self, key: &str) {
        self.inner.lock().await.remove(key);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a fetch cycle needs besides the request itself.
pub struct Engine {
    pub cfg: Arc<Bootstrap>,
    pub cache: Arc<dyn Cache>,
    pub upstream: UpstreamClient,
}

#[derive(Clone)]
pub struct Coalescer {
    registry: Arc<Registry>,
    engine: Arc<Engine>,
}

impl Coalescer {
    pub fn new(registry: Arc<Registry>, engine: Arc<Engine>) -> Self {
        Self { registry, engine }
    }

    /// Hands a non-hit request to the cache key's worker, creating the
    /// worker if none exists. The bounded queue is the backpressure
    /// point: the send blocks while it is full. If the worker shut
    /// down between lookup and send, the send fails and the request
    /// re-registers.
    pub async fn enqueue(&self, key: &str, shape: RequestShape, done: oneshot::Sender<HandlerResponse>) {
        let mut queued = QueuedRequest { shape, done };
        loop {
            let sender = {
                let mut map = self.registry.inner.lock().await;
                match map.get(key) {
                    Some(sender) => sender.clone(),
                    None => {
                        log::info!("starting range proxy worker cacheKey={key}");
                        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                        map.insert(key.to_string(), tx.clone());
                        spawn_worker(
                            Arc::clone(&self.registry),
                            Arc::clone(&self.engine),
                            key.to_string(),
                            rx,
                            tx.clone(),
                        );
                        tx
                    }
                }
            };
            match sender.send(queued).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(back)) => queued = back,
            }
        }
    }
}

fn spawn_worker(
    registry: Arc<Registry>,
    engine: Arc<Engine>,
    key: String,
    mut rx: mpsc::Receiver<QueuedRequest>,
    identity: mpsc::Sender<QueuedRequest>,
) {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(IDLE_POLL, rx.recv()).await {
                Ok(Some(request)) => process_queued(&engine, request).await,
                Ok(None) => break,
                Err(_) => {
                    // Idle long enough; deregister and drain under the
                    // same lock enqueue uses, so no request can land on
                    // a worker that has already decided to exit.
                    let mut map = registry.inner.lock().await;
                    if !rx.is_empty() {
                        continue;
                    }
                    if let Some(current) = map.get(&key) {
                        if current.same_channel(&identity) {
                            map.remove(&key);
                        }
                    }
                    drop(map);
                    rx.close();
                    while let Some(request) = rx.recv().await {
                        process_queued(&engine, request).await;
                    }
                    log::info!("stopping range proxy worker cacheKey={key}");
                    break;
                }
            }
        }
    });
}

/// Handles one dequeued request. The context is rebuilt from scratch
/// because the cache may have been populated since the request was
/// queued, typically by this worker's previous iteration.
async fn process_queued(engine: &Engine, request: QueuedRequest) {
    let ctx = match context::build(&request.shape, &engine.cache).await {
        Ok(ctx) => ctx,
        Err(ContextError::BadRequest(err)) => {
            log::error!("error building request context detail={err}");
            let _ = request.done.send(HandlerResponse::new(
                StatusCode::BAD_REQUEST,
                Bytes::from(err.to_string()),
            ));
            return;
        }
        Err(ContextError::Internal(err)) => {
            log::error!("error building request context detail={err}");
            let _ = request.done.send(HandlerResponse::internal_error());
            return;
        }
    };

    let response = if ctx.lookup == CacheLookup::Hit {
        log::debug!(
            "delayedCacheHit detail=\"cache was populated with needed data while this request was queued\""
        );
        respond_to_cache_hit(engine, ctx).await
    } else {
        run_fetch_cycle(engine, ctx).await
    };
    let _ = request.done.send(response);
}

/// Serves a request entirely from cache, stitching in latest-point
/// data when the window reaches the present.
pub async fn respond_to_cache_hit(engine: &Engine, mut ctx: RequestContext) -> HandlerResponse {
    metrics::cache_request_status()
        .with_label_values(&[
            &ctx.origin.origin_url,
            MN_QUERY_RANGE,
            ctx.lookup.as_str(),
            "200",
        ])
        .inc();

    ctx.matrix
        .crop_to_range(ctx.request.start, ctx.request.end + ctx.step_ms);

    let mut status = None;
    if ctx.wants_fast_forward() {
        match fetch::fetch_fast_forward(&engine.upstream, &ctx).await {
            Ok((vector, leg_status)) => {
                status = leg_status;
                if let Some(vector) = vector {
                    ctx.matrix = merge_vector(ctx.matrix, vector);
                }
            }
            Err(err) => {
                log::error!("error fetching data from origin detail={err}");
                return HandlerResponse::bad_gateway();
            }
        }
    }

    let body = match serde_json::to_vec(&ctx.matrix) {
        Ok(body) => body,
        Err(err) => {
            log::error!("matrix marshaling error detail={err}");
            return HandlerResponse::internal_error();
        }
    };

    HandlerResponse::new(status.unwrap_or(StatusCode::OK), Bytes::from(body))
}

/// One full origin-fetch cycle: fan out over the missing extents,
/// merge the deltas into the cached dataset, write the merged set
/// back, and shape the client's response window.
async fn run_fetch_cycle(engine: &Engine, mut ctx: RequestContext) -> HandlerResponse {
    let include_fast_forward = ctx.wants_fast_forward();
    let outcome = match fetch::fetch_deltas(&engine.upstream, &ctx, include_fast_forward).await {
        Ok(outcome) => outcome,
        Err(err) => {
            log::error!("error fetching data from origin detail={err}");
            return HandlerResponse::bad_gateway();
        }
    };

    let code = outcome.status.unwrap_or(StatusCode::OK);
    metrics::cache_request_status()
        .with_label_values(&[
            &ctx.origin.origin_url,
            MN_QUERY_RANGE,
            ctx.lookup.as_str(),
            code.as_str(),
        ])
        .inc();

    let mut uncached_count = 0usize;
    let mut matrix = std::mem::replace(&mut ctx.matrix, MatrixEnvelope::empty());

    if let Some(lower) = outcome.lower {
        uncached_count += lower.value_count();
        // The cached dataset is the newer side of a lower-delta merge.
        matrix = merge_matrix(matrix, lower);
    }
    if let Some(upper) = outcome.upper {
        uncached_count += upper.value_count();
        matrix = merge_matrix(upper, matrix);
    }

    // Retention: points older than the configured age never survive.
    matrix.crop_to_range(
        ctx.now_ms - ctx.origin.max_value_age_secs * 1000,
        0,
    );

    if ctx.lookup != CacheLookup::Hit {
        let mut cache_matrix = matrix.clone();
        if ctx.origin.no_cache_last_data_secs != 0 {
            cache_matrix.crop_to_range(
                0,
                ctx.now_ms - ctx.origin.no_cache_last_data_secs * 1000,
            );
        }
        match cache::encode_payload(&cache_matrix, engine.cfg.caching.compression) {
            Ok(payload) => {
                let ttl = engine.cfg.caching.record_ttl_secs();
                if let Err(err) = engine.cache.store(&ctx.cache_key, payload, ttl).await {
                    log::warn!("cache store failed cacheKey={} detail={err}", ctx.cache_key);
                } else {
                    log::debug!("setCacheRecord cacheKey={} ttl={ttl}", ctx.cache_key);
                }
            }
            Err(err) => {
                log::error!("matrix marshaling error detail={err}");
                return HandlerResponse::internal_error();
            }
        }
    }

    // A key miss fetched exactly the requested window; everything else
    // needs the client's view trimmed out of the merged dataset. One
    // extra step on the end keeps room for fast-forward data.
    if ctx.lookup != CacheLookup::KeyMiss {
        matrix.crop_to_range(ctx.request.start, ctx.request.end + ctx.step_ms);
    }

    let all_count = matrix.value_count();
    let cached_count = all_count.saturating_sub(uncached_count);
    if uncached_count > 0 {
        metrics::cache_request_elements()
            .with_label_values(&[&ctx.origin.origin_url, "uncached"])
            .inc_by(uncached_count as u64);
    }
    if cached_count > 0 {
        metrics::cache_request_elements()
            .with_label_values(&[&ctx.origin.origin_url, "cached"])
            .inc_by(cached_count as u64);
    }

    if let Some(vector) = outcome.fast_forward {
        matrix = merge_vector(matrix, vector);
    }

    let body = match serde_json::to_vec(&matrix) {
        Ok(body) => body,
        Err(err) => {
            log::error!("matrix marshaling error detail={err}");
            return HandlerResponse::internal_error();
        }
    };

    if code != StatusCode::OK {
        return HandlerResponse::new(code, outcome.error_body.unwrap_or_default());
    }
    HandlerResponse::new(code, Bytes::from(body))
}
