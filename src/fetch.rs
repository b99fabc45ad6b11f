use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::context::{RequestContext, UP_END, UP_QUERY, UP_START, UP_STEP, UP_TIME, UP_TIMEOUT};
use crate::metrics;
use crate::timeseries::{Extent, MatrixEnvelope, VectorEnvelope, STATUS_SUCCESS};
use crate::upstream::{self, UpstreamClient};

const MN_QUERY_RANGE: &str = "query_range";
const MN_QUERY: &str = "query";

/// What one origin-fetch cycle brought back: the delta envelopes that
/// answered each gap, the optional latest-point set, and a single
/// representative response status.
pub struct FetchOutcome {
    pub lower: Option<MatrixEnvelope>,
    pub upper: Option<MatrixEnvelope>,
    pub fast_forward: Option<VectorEnvelope>,
    pub status: Option<StatusCode>,
    pub error_body: Option<Bytes>,
}

#[derive(Default)]
struct SharedState {
    status: Option<StatusCode>,
    error_body: Option<Bytes>,
    transport_err: Option<anyhow::Error>,
}

impl SharedState {
    /// The first completion seeds the status; after that any
    /// non-success completion overwrites it. Completion order decides,
    /// matching the observed behavior this engine preserves.
    fn record_status(&mut self, status: StatusCode, body: &Bytes) {
        if self.status.is_none() || status != StatusCode::OK {
            if status != StatusCode::OK {
                self.error_body = Some(body.clone());
            }
            self.status = Some(status);
        }
    }
}

/// Issues the cycle's fetches concurrently: lower delta, upper delta,
/// and, when asked, the latest-point query. No leg cancels another;
/// all are awaited. Any transport-level failure (including a decode
/// failure of a successful response) fails the whole cycle.
pub async fn fetch_deltas(
    upstream: &UpstreamClient,
    ctx: &RequestContext,
    include_fast_forward: bool,
) -> Result<FetchOutcome> {
    let shared = Mutex::new(SharedState::default());

    let lower_leg = async {
        match ctx.lower {
            Some(extent) => fetch_matrix_delta(upstream, ctx, extent, &shared).await,
            None => None,
        }
    };
    let upper_leg = async {
        match ctx.upper {
            Some(extent) => fetch_matrix_delta(upstream, ctx, extent, &shared).await,
            None => None,
        }
    };
    let fast_forward_leg = async {
        if include_fast_forward {
            fetch_vector(upstream, ctx, &shared).await
        } else {
            None
        }
    };

    let (lower, upper, fast_forward) = tokio::join!(lower_leg, upper_leg, fast_forward_leg);

    let mut shared = shared.into_inner().expect("fetch shared state");
    if let Some(err) = shared.transport_err.take() {
        return Err(err);
    }

    Ok(FetchOutcome {
        lower,
        upper,
        fast_forward,
        status: shared.status,
        error_body: shared.error_body,
    })
}

/// The standalone latest-point fetch used on the full-hit path.
/// Returns the vector (when usable) and the leg's response status.
pub async fn fetch_fast_forward(
    upstream: &UpstreamClient,
    ctx: &RequestContext,
) -> Result<(Option<VectorEnvelope>, Option<StatusCode>)> {
    let shared = Mutex::new(SharedState::default());
    let vector = fetch_vector(upstream, ctx, &shared).await;
    let mut shared = shared.into_inner().expect("fetch shared state");
    if let Some(err) = shared.transport_err.take() {
        return Err(err);
    }
    Ok((vector, shared.status))
}

async fn fetch_matrix_delta(
    upstream: &UpstreamClient,
    ctx: &RequestContext,
    extent: Extent,
    shared: &Mutex<SharedState>,
) -> Option<MatrixEnvelope> {
    let mut params = Vec::new();
    passthrough_param(&ctx.params, UP_QUERY, &mut params);
    passthrough_param(&ctx.params, UP_TIMEOUT, &mut params);
    params.push((UP_STEP.to_string(), ctx.step_param.clone()));
    params.push((UP_START.to_string(), (extent.start / 1000).to_string()));
    params.push((UP_END.to_string(), (extent.end / 1000).to_string()));

    let uri = match upstream::build_uri(&format!("{}{MN_QUERY_RANGE}", ctx.origin.api_base()), &params) {
        Ok(uri) => uri,
        Err(err) => {
            shared.lock().expect("fetch shared state").transport_err = Some(err);
            return None;
        }
    };

    let started = Instant::now();
    let (status, _headers, body) = match upstream.fetch(uri, proxyable_headers(ctx)).await {
        Ok(resp) => resp,
        Err(err) => {
            shared.lock().expect("fetch shared state").transport_err = Some(err);
            return None;
        }
    };
    let duration = started.elapsed();

    shared
        .lock()
        .expect("fetch shared state")
        .record_status(status, &body);

    if status != StatusCode::OK {
        log::warn!(
            "error downloading URL url={}{MN_QUERY_RANGE} status={status}",
            ctx.origin.api_base()
        );
        return None;
    }

    let envelope: MatrixEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            shared.lock().expect("fetch shared state").transport_err =
                Some(anyhow!("matrix decoding error: {err}"));
            return None;
        }
    };

    if envelope.status != STATUS_SUCCESS {
        return None;
    }

    metrics::proxy_request_duration()
        .with_label_values(&[
            &ctx.origin.origin_url,
            MN_QUERY_RANGE,
            ctx.lookup.as_str(),
            status.as_str(),
        ])
        .observe(duration.as_secs_f64());

    Some(envelope)
}

async fn fetch_vector(
    upstream: &UpstreamClient,
    ctx: &RequestContext,
    shared: &Mutex<SharedState>,
) -> Option<VectorEnvelope> {
    let mut params = Vec::new();
    passthrough_param(&ctx.params, UP_QUERY, &mut params);
    passthrough_param(&ctx.params, UP_TIMEOUT, &mut params);
    passthrough_param(&ctx.params, UP_TIME, &mut params);

    let uri = match upstream::build_uri(&format!("{}{MN_QUERY}", ctx.origin.api_base()), &params) {
        Ok(uri) => uri,
        Err(err) => {
            shared.lock().expect("fetch shared state").transport_err = Some(err);
            return None;
        }
    };

    let (status, _headers, body) = match upstream.fetch(uri, proxyable_headers(ctx)).await {
        Ok(resp) => resp,
        Err(err) => {
            shared.lock().expect("fetch shared state").transport_err = Some(err);
            return None;
        }
    };

    shared
        .lock()
        .expect("fetch shared state")
        .record_status(status, &body);

    if status != StatusCode::OK {
        return None;
    }

    match serde_json::from_slice::<VectorEnvelope>(&body) {
        Ok(envelope) if envelope.status == STATUS_SUCCESS => Some(envelope),
        Ok(_) => None,
        Err(err) => {
            // A scalar result is not mergeable but also not an error.
            if is_scalar_result(&body) {
                return None;
            }
            shared.lock().expect("fetch shared state").transport_err =
                Some(anyhow!("vector decoding error: {err}"));
            None
        }
    }
}

fn is_scalar_result(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("data")
                .and_then(|d| d.get("resultType"))
                .and_then(|t| t.as_str())
                .map(|t| t == "scalar")
        })
        .unwrap_or(false)
}

fn passthrough_param(
    params: &HashMap<String, String>,
    name: &str,
    dst: &mut Vec<(String, String)>,
) {
    if let Some(value) = params.get(name) {
        dst.push((name.to_string(), value.clone()));
    }
}

/// Client headers worth forwarding to the origin; today that is only
/// the authorization principal.
fn proxyable_headers(ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(auth) = &ctx.authorization {
        if let Ok(value) = auth.parse() {
            headers.insert(http::header::AUTHORIZATION, value);
        }
    }
    headers
}
