use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use quickstep::config::{Bootstrap, Caching, Metrics, Origin, Server, Upstream};
use quickstep::server;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;

pub const PROXY_ADDR: &str = "127.0.0.1:18080";

/// Queries carrying this marker make the mock origin respond slowly,
/// which keeps concurrent requests in flight long enough to coalesce.
pub const SLOW_MARKER: &str = "slow";

static HARNESS: OnceCell<Harness> = OnceCell::const_new();

pub struct Harness {
    pub client: TestClient,
    pub origin: Arc<OriginState>,
}

pub async fn harness() -> &'static Harness {
    HARNESS
        .get_or_init(|| async {
            let (origin_addr, origin_state) = start_mock_origin();
            let cfg = test_config(&format!("http://{origin_addr}"));
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");
                runtime.block_on(async move {
                    let _ = server::run(Arc::new(cfg)).await;
                });
            });
            tokio::time::sleep(Duration::from_millis(300)).await;
            Harness {
                client: TestClient::new(PROXY_ADDR),
                origin: origin_state,
            }
        })
        .await
}

fn test_config(origin_url: &str) -> Bootstrap {
    let mut origins = HashMap::new();
    origins.insert(
        "default".to_string(),
        Origin {
            origin_url: origin_url.to_string(),
            ignore_no_cache_header: false,
            fast_forward_disable: true,
            ..Origin::default()
        },
    );
    origins.insert(
        "ffon".to_string(),
        Origin {
            origin_url: origin_url.to_string(),
            ignore_no_cache_header: false,
            fast_forward_disable: false,
            ..Origin::default()
        },
    );
    origins.insert(
        "down".to_string(),
        Origin {
            // Reserved discard port; connections fail immediately.
            origin_url: "http://127.0.0.1:9".to_string(),
            fast_forward_disable: true,
            ..Origin::default()
        },
    );

    Bootstrap {
        strict: false,
        pidfile: None,
        logger: Default::default(),
        server: Server {
            addr: PROXY_ADDR.to_string(),
        },
        metrics: Metrics {
            enabled: false,
            addr: String::new(),
        },
        caching: Caching {
            cache_type: "memory".to_string(),
            compression: true,
            ..Default::default()
        },
        origins,
        default_origin_url: None,
        upstream: Upstream::default(),
    }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub fn new(proxy: &str) -> Self {
        Self {
            proxy_addr: proxy.parse().expect("proxy addr"),
        }
    }

    pub async fn get(&self, path_and_query: &str, headers: HeaderMap) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .header(http::header::HOST, self.proxy_addr.to_string());
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub query: String,
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

#[derive(Default)]
pub struct OriginState {
    pub range_requests: Mutex<Vec<RangeQuery>>,
    pub instant_requests: Mutex<Vec<String>>,
}

impl OriginState {
    pub fn range_count(&self, query: &str) -> usize {
        self.range_requests
            .lock()
            .expect("range requests")
            .iter()
            .filter(|r| r.query == query)
            .count()
    }

    pub fn range_queries(&self, query: &str) -> Vec<RangeQuery> {
        self.range_requests
            .lock()
            .expect("range requests")
            .iter()
            .filter(|r| r.query == query)
            .cloned()
            .collect()
    }

    pub fn instant_count(&self, query: &str) -> usize {
        self.instant_requests
            .lock()
            .expect("instant requests")
            .iter()
            .filter(|q| q.as_str() == query)
            .count()
    }
}

/// A simulated origin: deterministic matrix data for any range query,
/// a fixed-value vector for instant queries, and a marker response for
/// everything else. Runs on its own thread so it outlives any single
/// test's runtime.
fn start_mock_origin() -> (SocketAddr, Arc<OriginState>) {
    let state = Arc::new(OriginState::default());
    let handler_state = Arc::clone(&state);
    let port = Arc::new(AtomicU16::new(0));
    let port_out = Arc::clone(&port);

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
            let addr = listener.local_addr().expect("local addr");
            port_out.store(addr.port(), Ordering::SeqCst);
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&handler_state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, hyper::Error>(mock_handler(&state, req).await) }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    let _ = builder.serve_connection(io, service).await;
                });
            }
        });
    });

    let mut waited = 0;
    while port.load(Ordering::SeqCst) == 0 && waited < 100 {
        std::thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    let addr: SocketAddr = format!("127.0.0.1:{}", port.load(Ordering::SeqCst))
        .parse()
        .expect("mock addr");
    (addr, state)
}

async fn mock_handler(state: &OriginState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let params = parse_params(req.uri().query().unwrap_or(""));
    let query = params.get("query").cloned().unwrap_or_default();

    match path.as_str() {
        "/api/v1/query_range" => {
            let start = params
                .get("start")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let end = params
                .get("end")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let step = params
                .get("step")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60);
            state
                .range_requests
                .lock()
                .expect("range requests")
                .push(RangeQuery {
                    query: query.clone(),
                    start,
                    end,
                    step,
                });
            if query.contains(SLOW_MARKER) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            json_response(StatusCode::OK, matrix_body(start, end, step))
        }
        "/api/v1/query" => {
            state
                .instant_requests
                .lock()
                .expect("instant requests")
                .push(query);
            // With no explicit time, answer from slightly ahead of the
            // aligned range so a fast-forward merge is always newer
            // than the last range sample.
            let time = params
                .get("time")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or_else(|| now_secs() + 15);
            json_response(StatusCode::OK, vector_body(time))
        }
        "/api/v1/label/__name__/values" => json_response(
            StatusCode::OK,
            r#"{"status":"success","data":["up"]}"#.to_string(),
        ),
        _ => {
            let mut resp = json_response(StatusCode::OK, r#"{"status":"success"}"#.to_string());
            resp.headers_mut()
                .insert("x-mock-passthrough", "1".parse().unwrap());
            resp
        }
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
}

/// One sample per step across the inclusive range, value derived from
/// the timestamp so merged datasets stay verifiable.
fn matrix_body(start: i64, end: i64, step: i64) -> String {
    let mut values = Vec::new();
    let mut t = start;
    while t <= end {
        values.push(format!("[{t},\"{}\"]", sample_value(t)));
        t += step;
    }
    format!(
        r#"{{"status":"success","data":{{"resultType":"matrix","result":[{{"metric":{{"__name__":"mock_series","instance":"promsim"}},"values":[{}]}}]}}}}"#,
        values.join(",")
    )
}

fn vector_body(time: i64) -> String {
    format!(
        r#"{{"status":"success","data":{{"resultType":"vector","result":[{{"metric":{{"__name__":"mock_series","instance":"promsim"}},"value":[{time},"424242"]}}]}}}}"#
    )
}

pub fn sample_value(t: i64) -> i64 {
    t % 1000
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn parse_params(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            let plussed = s.replace('+', " ");
            urlencoding::decode(&plussed)
                .map(|c| c.into_owned())
                .unwrap_or(plussed)
        };
        params.insert(decode(k), decode(v));
    }
    params
}

/// Builds an encoded query_range request path.
pub fn range_path(prefix: &str, query: &str, start: i64, end: i64, step: i64) -> String {
    format!(
        "{prefix}/api/v1/query_range?query={}&start={start}&end={end}&step={step}",
        urlencoding::encode(query)
    )
}
