use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::config;

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(cfg: &config::Upstream) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let https = if cfg.insecure_skip_verify {
            let tls = insecure_tls_config();
            HttpsConnectorBuilder::new()
                .with_tls_config(tls)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        } else {
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .expect("load native tls roots")
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        };
        let mut builder = Client::builder(TokioExecutor::new());
        let mut max_idle_per_host = if cfg.max_idle_conns_per_host > 0 {
            cfg.max_idle_conns_per_host
        } else {
            usize::MAX
        };
        if cfg.max_idle_conns > 0 {
            max_idle_per_host = max_idle_per_host.min(cfg.max_idle_conns);
        }
        if max_idle_per_host != usize::MAX {
            builder.pool_max_idle_per_host(max_idle_per_host);
        }
        let client = builder.build(https);
        Self {
            client,
            timeout: cfg.timeout(),
        }
    }

    /// Issues a GET against the origin and collects the full body.
    /// A timed-out exchange surfaces as a transport error.
    pub async fn fetch(
        &self,
        uri: Uri,
        headers: HeaderMap,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let mut req = http::Request::builder().method(Method::GET).uri(uri.clone());
        for (k, v) in headers.iter() {
            req = req.header(k, v);
        }
        let req = req
            .body(Full::new(Bytes::new()))
            .context("build upstream request")?;

        let exchange = async {
            let resp = self.client.request(req).await.context("upstream request")?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = collect_body(resp).await?;
            Ok::<_, anyhow::Error>((status, headers, body))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("upstream request timed out fetching {uri}")),
        }
    }
}

async fn collect_body(resp: http::Response<Incoming>) -> Result<Bytes> {
    let body = resp
        .into_body()
        .collect()
        .await
        .context("read upstream body")?;
    Ok(body.to_bytes())
}

/// Joins a base URL with an encoded query string built from params.
pub fn build_uri(base: &str, params: &[(String, String)]) -> Result<Uri> {
    let mut full = base.to_string();
    if !params.is_empty() {
        full.push('?');
        for (i, (k, v)) in params.iter().enumerate() {
            if i > 0 {
                full.push('&');
            }
            full.push_str(&urlencoding::encode(k));
            full.push('=');
            full.push_str(&urlencoding::encode(v));
        }
    }
    full.parse::<Uri>()
        .with_context(|| format!("parse upstream uri {full}"))
}

fn insecure_tls_config() -> rustls::ClientConfig {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .expect("tls versions");
    let verifier = Arc::new(NoVerifier {});
    builder
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
