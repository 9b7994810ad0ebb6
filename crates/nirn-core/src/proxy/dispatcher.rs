//! HTTP front door.
//!
//! Everything outside `/nirn/` is treated as a Discord REST call: the
//! dispatcher derives the bucket key, decides between local execution and
//! routing to the cluster node that owns the key, and emits synthetic 429s
//! whenever an internal failure is retriable from the client's perspective.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::ProxyError;
use crate::logging::redact;
use crate::metrics;
use crate::proxy::bucket_path::optimistic_bucket_path;
use crate::proxy::bucket_queue::ProxiedRequest;
use crate::proxy::cluster::ClusterRouter;
use crate::proxy::discord::{DiscordClient, UpstreamResponse};
use crate::proxy::global::{
    GlobalRateLimiter, BOT_HASH_HEADER, BOT_LIMIT_HEADER, GLOBAL_RPC_PATH,
};
use crate::proxy::registry::QueueRegistry;
use crate::util::hash_crc64;

/// Marks a request as already routed once; such requests are never
/// re-routed, preventing hop loops during view disagreement.
pub const ROUTED_HEADER: &str = "nirn-routed-to";

/// Client-supplied per-request abort budget in seconds.
pub const ABORT_AFTER_HEADER: &str = "x-ratelimit-abort-after";

const RATELIMITED_BODY: &str =
    "{\"global\":false,\"message\":\"You are being rate limited.\",\"retry_after\":1}";
const ABORTED_BODY: &str =
    "{\"message\":\"Request aborted because of ratelimits\",\"code\":0}";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<QueueRegistry>,
    pub global: Arc<GlobalRateLimiter>,
    pub router: Arc<ClusterRouter>,
    pub client: Arc<DiscordClient>,
    pub config: Arc<Config>,
}

/// Build the full proxy router: internal endpoints plus the catch-all
/// Discord reverse proxy.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/nirn/healthz", get(healthz))
        .route(GLOBAL_RPC_PATH, get(handle_global))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Cross-node global-limit RPC. Blocks until a token has been taken from
/// the local bucket, so the calling node's request is admitted only once
/// the reservation actually exists.
async fn handle_global(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let bot_hash = match header_u64(&headers, BOT_HASH_HEADER) {
        Some(v) => v,
        None => return StatusCode::BAD_REQUEST,
    };
    let bot_limit = match header_u64(&headers, BOT_LIMIT_HEADER) {
        Some(v) => v,
        None => return StatusCode::BAD_REQUEST,
    };

    state.global.take(bot_hash, bot_limit).await;
    tracing::trace!(bot_hash, "returned OK for global request");
    StatusCode::OK
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

struct OpenConnectionGuard;

impl OpenConnectionGuard {
    fn new() -> Self {
        metrics::inc_open_connections();
        Self
    }
}

impl Drop for OpenConnectionGuard {
    fn drop(&mut self) {
        metrics::dec_open_connections();
    }
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let _guard = OpenConnectionGuard::new();

    let (mut parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);
    let method = parts.method.clone();

    let token = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let already_routed = parts.headers.remove(ROUTED_HEADER).is_some();
    if already_routed {
        metrics::inc_routed_received();
    }

    let bucket = optimistic_bucket_path(&path, method.as_str());
    tracing::trace!(
        bucket = %redact(&bucket),
        path = %redact(&path),
        method = %method,
        forwarded_for = ?parts.headers.get("x-forwarded-for"),
        "inbound request"
    );
    let routing_hash = if token.starts_with("Bearer") {
        hash_crc64(&token)
    } else {
        hash_crc64(&bucket)
    };

    // A request that already hopped once is never re-routed.
    let route_to = if already_routed {
        None
    } else {
        state.router.route(routing_hash)
    };

    if let Some(addr) = route_to {
        return forward_to_peer(&state, &addr, method, &path, query.as_deref(), parts.headers, body)
            .await;
    }

    let queue = match state.registry.get_or_create(&token).await {
        Ok(queue) => queue,
        Err(err) => {
            metrics::inc_error();
            tracing::error!(error = %err, function = "get_or_create", "failed to build token queue");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let abort_after = header_u64(&parts.headers, ABORT_AFTER_HEADER)
        .or(state.config.ratelimit_abort_after);

    let proxied = ProxiedRequest {
        method,
        path,
        query,
        headers: parts.headers,
        body,
        abort_after,
    };

    match queue.queue(bucket, proxied).await {
        Ok(response) => upstream_into_response(response),
        Err(err) => error_into_response(err, &state.config),
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_to_peer(
    state: &AppState,
    addr: &str,
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = match query {
        Some(q) => format!("http://{addr}{path}?{q}"),
        None => format!("http://{addr}{path}"),
    };

    let mut headers = headers;
    if let Ok(value) = HeaderValue::from_str(addr) {
        headers.insert(ROUTED_HEADER, value);
    }

    tracing::trace!(to = addr, path = %redact(path), "routing request to cluster node");

    let result = state
        .client
        .raw()
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match result {
        Ok(response) => {
            metrics::inc_routed_sent();
            let status = response.status();
            let resp_headers = response.headers().clone();
            match response.bytes().await {
                Ok(bytes) => upstream_into_response(UpstreamResponse {
                    status,
                    headers: resp_headers,
                    body: bytes,
                }),
                Err(err) => {
                    metrics::inc_routed_error();
                    tracing::error!(error = %err, to = addr, "failed reading routed response");
                    synthetic_429()
                }
            }
        }
        Err(err) => {
            metrics::inc_routed_error();
            tracing::error!(error = %err, to = addr, "failed to route request");
            // The peer will release its reservation on its own; retrying
            // through a synthetic 429 is safe for the client.
            synthetic_429()
        }
    }
}

fn upstream_into_response(response: UpstreamResponse) -> Response {
    let mut headers = response.headers;
    // The body is re-buffered; stale framing headers must not survive.
    headers.remove("content-length");
    headers.remove("transfer-encoding");
    (response.status, headers, response.body).into_response()
}

fn error_into_response(err: ProxyError, config: &Config) -> Response {
    match err {
        ProxyError::UpstreamTimeout => {
            if config.ratelimit_over_408 {
                synthetic_429()
            } else {
                (StatusCode::REQUEST_TIMEOUT, err.to_string()).into_response()
            }
        }
        ProxyError::AbortedByBudget => {
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            (StatusCode::REQUEST_TIMEOUT, headers, ABORTED_BODY).into_response()
        }
        ProxyError::QueueClosed | ProxyError::GlobalRpc(_) => synthetic_429(),
        other => {
            metrics::inc_error();
            tracing::error!(error = %other, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

/// Retriable synthetic 429 with fabricated ratelimit headers.
fn synthetic_429() -> Response {
    let reset_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() + 1)
        .unwrap_or_default();

    let mut headers = HeaderMap::new();
    headers.insert("generated-by-proxy", HeaderValue::from_static("true"));
    headers.insert("x-ratelimit-scope", HeaderValue::from_static("user"));
    headers.insert("x-ratelimit-limit", HeaderValue::from_static("1"));
    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
    if let Ok(value) = HeaderValue::from_str(&reset_at.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
    headers.insert("x-ratelimit-after", HeaderValue::from_static("1"));
    headers.insert("retry-after", HeaderValue::from_static("1"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));

    (StatusCode::TOO_MANY_REQUESTS, headers, RATELIMITED_BODY).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_429_has_fabricated_headers() {
        let response = synthetic_429();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("generated-by-proxy").unwrap(), "true");
        assert_eq!(headers.get("retry-after").unwrap(), "1");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    }

    #[test]
    fn framing_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("9999"));
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5"));
        let response = upstream_into_response(UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"ok"),
        });
        assert!(response.headers().get("x-ratelimit-limit").is_some());
        // axum recomputes framing for the buffered body
        assert_ne!(
            response.headers().get("content-length"),
            Some(&HeaderValue::from_static("9999"))
        );
    }
}
