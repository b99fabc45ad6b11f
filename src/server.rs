use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CACHE_CONTROL, HOST};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use crate::cache;
use crate::coalesce::{respond_to_cache_hit, Coalescer, Engine, HandlerResponse, Registry};
use crate::config::{Bootstrap, Origin};
use crate::context::{self, RequestShape, UP_ORIGIN, UP_TIME};
use crate::delta::CacheLookup;
use crate::metrics;
use crate::upstream::{self, UpstreamClient};

const API_PATH: &str = "/api/v1/";
const MN_QUERY_RANGE: &str = "query_range";
const MN_QUERY: &str = "query";
const MN_LABELS: &str = "label/__name__/values";

const HV_NO_CACHE: &str = "no-cache";
const HV_APPLICATION_JSON: &str = "application/json";

const INSTANT_TTL_SECS: i64 = 15;
const INSTANT_ROLLUP_TTL_SECS: i64 = 1800;

pub struct AppState {
    pub cfg: Arc<Bootstrap>,
    pub engine: Arc<Engine>,
    pub coalescer: Coalescer,
}

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let cache = cache::create(&cfg.caching, Arc::clone(&registry))?;
    cache.connect().await?;

    let upstream = UpstreamClient::new(&cfg.upstream);
    let engine = Arc::new(Engine {
        cfg: Arc::clone(&cfg),
        cache: Arc::clone(&cache),
        upstream,
    });
    let coalescer = Coalescer::new(registry, Arc::clone(&engine));

    if cfg.metrics.enabled && !cfg.metrics.addr.trim().is_empty() {
        metrics::serve(&cfg.metrics.addr).await?;
    }

    let state = Arc::new(AppState {
        cfg: Arc::clone(&cfg),
        engine,
        coalescer,
    });

    let socket_addr: SocketAddr = cfg.server.addr.parse().context("parse server.addr")?;
    let listener = TcpListener::bind(socket_addr).await.context("bind tcp")?;
    log::info!("proxy http endpoint starting address={}", cfg.server.addr);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, hyper::Error>(handle(state, req).await) }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    let _ = builder.serve_connection(io, service).await;
                });
            }
        }
    }

    log::info!("shutting down");
    state.engine.cache.close().await?;
    Ok(())
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        loop {
            tokio::select! {
                _ = async {
                    if let Some(sig) = sigterm.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    let _ = shutdown.send(true);
                    break;
                }
                _ = async {
                    if let Some(sig) = sigint.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    let _ = shutdown.send(true);
                    break;
                }
            }
        }
    });
}

async fn handle(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    metrics::requests_total().inc();

    let path = req.uri().path().to_string();
    let params = context::parse_query_params(req.uri().query().unwrap_or(""));
    let headers = req.headers().clone();

    if path == "/ping" {
        return ping_response();
    }

    let (moniker, rest) = split_moniker(&path);
    let origin = resolve_origin(&state.cfg, moniker, &params, &headers);

    if rest == "/health" {
        return health_handler(&state, &origin, &params, &headers).await;
    }
    if let Some(method) = rest.strip_prefix(API_PATH) {
        match method {
            MN_QUERY_RANGE => return query_range_handler(&state, origin, params, &headers).await,
            MN_QUERY => return instant_query_handler(&state, &origin, params, &headers).await,
            _ => return full_proxy_handler(&state, &origin, rest, &params, &headers).await,
        }
    }

    full_proxy_handler(&state, &origin, &path, &params, &headers).await
}

/// Peels a leading origin moniker off paths shaped like
/// `/{origin}/api/v1/...` or `/{origin}/health`.
fn split_moniker(path: &str) -> (Option<&str>, &str) {
    if path.starts_with(API_PATH) || path == "/health" {
        return (None, path);
    }
    let trimmed = path.trim_start_matches('/');
    if let Some((first, _)) = trimmed.split_once('/') {
        let rest = &path[first.len() + 1..];
        if rest.starts_with(API_PATH) || rest == "/health" {
            return (Some(first), rest);
        }
    }
    (None, path)
}

/// Origin precedence: path moniker, then the `origin` URL parameter,
/// then the Host header, finally the configured default.
fn resolve_origin(
    cfg: &Bootstrap,
    moniker: Option<&str>,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Origin {
    let name = moniker
        .map(str::to_string)
        .or_else(|| params.get(UP_ORIGIN).cloned())
        .or_else(|| {
            headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    cfg.origin(&name)
}

fn ping_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CACHE_CONTROL, HV_NO_CACHE)
        .body(Full::new(Bytes::from_static(b"pong")))
        .unwrap()
}

/// The delta engine path. Full hits answer inline; anything else is
/// queued to the cache key's worker and this task blocks on the
/// completion signal.
async fn query_range_handler(
    state: &Arc<AppState>,
    origin: Origin,
    params: HashMap<String, String>,
    headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    let shape = RequestShape {
        origin,
        params,
        authorization: header_value(headers, AUTHORIZATION.as_str()),
        no_cache: headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(HV_NO_CACHE))
            .unwrap_or(false),
    };

    let ctx = match context::build(&shape, &state.engine.cache).await {
        Ok(ctx) => ctx,
        Err(context::ContextError::BadRequest(err)) => {
            log::error!("error building request context detail={err}");
            return api_response(HandlerResponse::new(
                StatusCode::BAD_REQUEST,
                Bytes::from(err.to_string()),
            ));
        }
        Err(context::ContextError::Internal(err)) => {
            log::error!("error building request context detail={err}");
            return api_response(HandlerResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::new(),
            ));
        }
    };

    if ctx.lookup == CacheLookup::Hit {
        let response = respond_to_cache_hit(&state.engine, ctx).await;
        return api_response(response);
    }

    let (done_tx, done_rx) = oneshot::channel();
    state
        .coalescer
        .enqueue(&ctx.cache_key, shape, done_tx)
        .await;

    match done_rx.await {
        Ok(response) => api_response(response),
        Err(_) => api_response(HandlerResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            Bytes::new(),
        )),
    }
}

/// Instantaneous queries get their own short-TTL cache: the `time`
/// parameter is quantized to 15s buckets, and stale half-hour-aligned
/// timestamps (rollup-style queries) cache for 30 minutes.
async fn instant_query_handler(
    state: &Arc<AppState>,
    origin: &Origin,
    mut params: HashMap<String, String>,
    headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    let mut ttl = INSTANT_TTL_SECS;
    if let Some(raw) = params.get(UP_TIME).cloned() {
        let ms = match context::parse_time(&raw) {
            Ok(ms) => ms,
            Err(err) => {
                log::error!("error fetching data from origin detail={err}");
                return api_response(HandlerResponse::new(StatusCode::BAD_GATEWAY, Bytes::new()));
            }
        };
        let mut end = ms / 1000;
        let now = context::unix_ms() / 1000;
        if end <= now - 1800 && end % 1800 == 0 {
            ttl = INSTANT_ROLLUP_TTL_SECS;
        }
        end = (end / 15) * 15;
        params.insert(UP_TIME.to_string(), end.to_string());
    }

    let url = format!("{}{MN_QUERY}", origin.api_base());
    let mut key_base = url.clone();
    let authorization = header_value(headers, AUTHORIZATION.as_str());
    if let Some(auth) = &authorization {
        key_base.push_str(auth);
    }
    let cache_key = context::derive_cache_key(&key_base, &params);

    if let Ok(body) = state.engine.cache.retrieve(&cache_key).await {
        metrics::cache_request_status()
            .with_label_values(&[&origin.origin_url, MN_QUERY, "hit", "200"])
            .inc();
        return api_response(HandlerResponse::new(StatusCode::OK, body));
    }

    let param_list: Vec<(String, String)> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let uri = match upstream::build_uri(&url, &param_list) {
        Ok(uri) => uri,
        Err(err) => {
            log::error!("error fetching data from origin detail={err}");
            return api_response(HandlerResponse::new(StatusCode::BAD_GATEWAY, Bytes::new()));
        }
    };

    let started = std::time::Instant::now();
    match state
        .engine
        .upstream
        .fetch(uri, auth_headers(authorization.as_deref()))
        .await
    {
        Ok((status, _resp_headers, body)) => {
            metrics::proxy_request_duration()
                .with_label_values(&[&origin.origin_url, MN_QUERY, "kmiss", status.as_str()])
                .observe(started.elapsed().as_secs_f64());
            if let Err(err) = state.engine.cache.store(&cache_key, body.clone(), ttl).await {
                log::warn!("cache store failed cacheKey={cache_key} detail={err}");
            }
            metrics::cache_request_status()
                .with_label_values(&[&origin.origin_url, MN_QUERY, "kmiss", status.as_str()])
                .inc();
            api_response(HandlerResponse::new(status, body))
        }
        Err(err) => {
            log::error!("error fetching data from origin detail={err}");
            api_response(HandlerResponse::new(StatusCode::BAD_GATEWAY, Bytes::new()))
        }
    }
}

/// Proxies the origin's labels endpoint to report upstream health.
async fn health_handler(
    state: &Arc<AppState>,
    origin: &Origin,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    let url = format!("{}{MN_LABELS}", origin.api_base());
    let param_list: Vec<(String, String)> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let uri = match upstream::build_uri(&url, &param_list) {
        Ok(uri) => uri,
        Err(err) => {
            log::error!("error fetching data from origin detail={err}");
            return plain_response(StatusCode::BAD_GATEWAY, Bytes::new());
        }
    };
    let authorization = header_value(headers, AUTHORIZATION.as_str());
    match state
        .engine
        .upstream
        .fetch(uri, auth_headers(authorization.as_deref()))
        .await
    {
        Ok((status, resp_headers, body)) => mirrored_response(status, &resp_headers, body),
        Err(err) => {
            log::error!("error fetching data from origin detail={err}");
            plain_response(StatusCode::BAD_GATEWAY, Bytes::new())
        }
    }
}

/// Transparent passthrough for any path the delta engine does not
/// understand.
async fn full_proxy_handler(
    state: &Arc<AppState>,
    origin: &Origin,
    path: &str,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    let url = format!("{}{}", origin.origin_url.trim_end_matches('/'), path);
    let param_list: Vec<(String, String)> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let uri = match upstream::build_uri(&url, &param_list) {
        Ok(uri) => uri,
        Err(err) => {
            log::error!("error fetching data from origin detail={err}");
            return plain_response(StatusCode::BAD_GATEWAY, Bytes::new());
        }
    };
    let authorization = header_value(headers, AUTHORIZATION.as_str());
    match state
        .engine
        .upstream
        .fetch(uri, auth_headers(authorization.as_deref()))
        .await
    {
        Ok((status, resp_headers, body)) => mirrored_response(status, &resp_headers, body),
        Err(err) => {
            log::error!("error fetching data from origin detail={err}");
            plain_response(StatusCode::BAD_GATEWAY, Bytes::new())
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn auth_headers(authorization: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(auth) = authorization {
        if let Ok(value) = auth.parse() {
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers
}

/// API responses are readonly and harmless, so CORS is wide open; the
/// JSON content type lets dashboards auto-parse the payload.
fn api_response(response: HandlerResponse) -> Response<Full<Bytes>> {
    Response::builder()
        .status(response.status)
        .header("Access-Control-Allow-Origin", "*")
        .header(http::header::CONTENT_TYPE, HV_APPLICATION_JSON)
        .body(Full::new(response.body))
        .unwrap()
}

fn plain_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body))
        .unwrap()
}

fn mirrored_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        if k == http::header::CONTENT_LENGTH || k == http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(k, v);
    }
    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| plain_response(StatusCode::BAD_GATEWAY, Bytes::new()))
}
