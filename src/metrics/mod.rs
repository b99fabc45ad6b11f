use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

pub fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("quickstep_requests_total", "Total requests handled").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

pub fn cache_request_status() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "quickstep_cache_request_status_total",
                "Cache lookup results by origin, method and response code",
            ),
            &["origin", "method", "lookup", "code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

pub fn proxy_request_duration() -> &'static HistogramVec {
    static METRIC: OnceLock<HistogramVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "quickstep_proxy_request_duration_seconds",
                "Time taken fetching from the origin",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0, 30.0]),
            &["origin", "method", "lookup", "code"],
        )
        .unwrap();
        registry().register(Box::new(histogram.clone())).unwrap();
        histogram
    })
}

pub fn cache_request_elements() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "quickstep_cache_request_elements_total",
                "Data points served, split by cached and uncached",
            ),
            &["origin", "kind"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&registry().gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Serves `/metrics` on a dedicated listener.
pub async fn serve(addr: &str) -> Result<()> {
    let socket_addr: SocketAddr = addr.parse().context("parse metrics.addr")?;
    let listener = TcpListener::bind(socket_addr)
        .await
        .context("bind metrics listener")?;
    log::info!("metrics http endpoint starting address={addr}");

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    log::warn!("metrics accept failed: {err}");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let body = render();
                    Ok::<_, hyper::Error>(
                        http::Response::builder()
                            .status(http::StatusCode::OK)
                            .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let builder = ConnBuilder::new(TokioExecutor::new());
                let _ = builder.serve_connection(io, service).await;
            });
        }
    });

    Ok(())
}
