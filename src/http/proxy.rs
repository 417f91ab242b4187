//! Forwarding of admitted requests to a rule's target.

use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use axum::response::Response;
use bytes::Bytes;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};

/// Connection-scoped headers that are never forwarded in either direction.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const KEEP_ALIVE: &str = "keep-alive";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// One request to forward.
#[derive(Debug)]
pub struct Forward<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
    pub host: Option<&'a str>,
}

pub struct ProxyDispatcher {
    client: reqwest::Client,
}

impl ProxyDispatcher {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build upstream client: {}", e)))?;
        Ok(Self { client })
    }

    /// Send the request to `target` and stream the backend's response back.
    ///
    /// Status, headers and body are returned as the backend sent them, minus
    /// hop-by-hop headers. Backend failures are not retried.
    pub async fn forward(&self, target: &Url, request: Forward<'_>) -> Result<Response> {
        let url = upstream_url(target, request.uri);
        let headers = upstream_headers(&request);

        debug!(method = %request.method, url = %url, "Forwarding request");

        let upstream = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Upstream request failed");
                if e.is_timeout() {
                    GatewayError::UpstreamTimeout(url.to_string())
                } else {
                    GatewayError::UpstreamUnavailable(url.to_string())
                }
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// The target's scheme and authority with the request's path and query.
/// A path on the target itself is not prepended.
pub fn upstream_url(target: &Url, uri: &Uri) -> Url {
    let mut url = target.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url.set_fragment(None);
    url
}

fn upstream_headers(request: &Forward<'_>) -> HeaderMap {
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let forwarded_for = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{}, {}", existing, request.client_ip),
        None => request.client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(value) = request.host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP) {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);
}
