//! Data-plane handler: match, identify, limit, validate, forward.

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::uri::Authority;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::proxy::Forward;
use super::state::AppState;
use crate::analytics::TrafficRecord;
use crate::antibot::Submission;
use crate::error::{GatewayError, Result};
use crate::identity::RequestView;
use crate::ratelimit::Decision;

pub const RATELIMIT_QUEUED_HEADER: &str = "x-ratelimit-queued";
pub const RATELIMIT_DELAY_HEADER: &str = "x-ratelimit-delay-ms";
pub const RATELIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// What happened to a request on its way through the gates.
#[derive(Debug, Default)]
struct Passage {
    queued: bool,
    delay: Option<Duration>,
    remaining: Option<u64>,
}

/// Catch-all handler for proxied routes.
#[instrument(skip_all, fields(method = %method, path = %uri.path()))]
pub async fn proxy_request(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let peer = connect.map(|ConnectInfo(addr)| addr.ip());
    let client_ip = client_ip(peer, &headers, state.config.server.trust_forwarded_for);
    let host = request_host(&headers);

    let mut passage = Passage::default();
    let result = dispatch(
        &state,
        &mut passage,
        &method,
        &uri,
        &headers,
        body,
        client_ip,
        host.as_deref(),
    )
    .await;

    let allowed = result.is_ok();
    let blocked = result.as_ref().is_err_and(|e| e.is_rejection());
    let mut response = match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    if allowed {
        decorate(&mut response, &passage);
    }

    state.analytics.record(TrafficRecord {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        method: method.to_string(),
        path: uri.path().to_string(),
        host,
        client_ip: client_ip.to_string(),
        status_code: response.status().as_u16(),
        allowed,
        blocked,
        queued: passage.queued,
    });

    response
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &AppState,
    passage: &mut Passage,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Body,
    client_ip: IpAddr,
    host: Option<&str>,
) -> Result<Response> {
    let body = read_body(headers, body, state.config.server.max_body_bytes).await?;

    let snapshot = state.rules.snapshot();
    let rule = snapshot
        .find(method, host, uri.path())
        .ok_or_else(|| GatewayError::NoRoute(uri.path().to_string()))?;

    let view = RequestView {
        client_ip,
        headers,
        body: &body,
    };
    let identity = state.resolver.resolve(&rule, &view).await;
    trace!(rule_id = %rule.id(), identifier = %identity.key, source = %identity.source, "Resolved identifier");

    match state.limiter.admit(&rule.rule, &identity.key, Instant::now()) {
        Decision::Allow { remaining } => passage.remaining = Some(remaining),
        Decision::Queue(ticket) => {
            passage.queued = true;
            let delay = ticket.wait().await?;
            debug!(rule_id = %rule.id(), delay_ms = delay.as_millis() as u64, "Released from queue");
            passage.delay = Some(delay);
        }
        Decision::Reject {
            queue_full,
            retry_after,
        } => {
            let retry_after_secs = retry_after_secs(retry_after);
            return Err(if queue_full {
                GatewayError::QueueFull { retry_after_secs }
            } else {
                GatewayError::RateLimitExceeded { retry_after_secs }
            });
        }
    }

    if state.antibot.applies_to(method) {
        state.antibot.validate(&Submission::from_headers(headers))?;
    }

    let target = rule
        .target
        .as_ref()
        .ok_or_else(|| GatewayError::NoRoute(uri.path().to_string()))?;

    state
        .proxy
        .forward(
            target,
            Forward {
                method,
                uri,
                headers,
                body,
                client_ip,
                host,
            },
        )
        .await
}

async fn read_body(headers: &HeaderMap, body: Body, max: usize) -> Result<Bytes> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > max as u64) {
        return Err(GatewayError::PayloadTooLarge);
    }
    to_bytes(body, max)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge)
}

/// Whole seconds until the window resets, at least one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

fn decorate(response: &mut Response, passage: &Passage) {
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(RATELIMIT_QUEUED_HEADER),
        HeaderValue::from_static(if passage.queued { "true" } else { "false" }),
    );
    if let Some(delay) = passage.delay {
        headers.insert(
            HeaderName::from_static(RATELIMIT_DELAY_HEADER),
            HeaderValue::from(delay.as_millis() as u64),
        );
    }
    if let Some(remaining) = passage.remaining {
        headers.insert(
            HeaderName::from_static(RATELIMIT_REMAINING_HEADER),
            HeaderValue::from(remaining),
        );
    }
}

/// The socket peer, or the first `X-Forwarded-For` hop when that header is
/// trusted.
pub fn client_ip(peer: Option<IpAddr>, headers: &HeaderMap, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Host name from the `Host` header, without the port.
fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Authority>().ok())
        .map(|authority| authority.host().to_string())
}
