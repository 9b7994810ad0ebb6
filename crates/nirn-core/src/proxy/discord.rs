//! Outbound Discord REST client.
//!
//! One shared reqwest client executes every upstream request. The client
//! also owns the per-identity endpoint cache, the gateway URL rewrite, and
//! the request histogram observation, so queue code only ever sees a
//! finished [`UpstreamResponse`].

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::Deserialize;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::logging::redact;
use crate::proxy::bucket_path::metrics_path;
use crate::proxy::cache::{cache_ttl_for, CacheEntry, EndpointCache};
use crate::{metrics, util};

const DEFAULT_BASE_URL: &str = "https://discord.com";

/// Bot identity from `users/@me`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: String,
    pub username: String,
    #[serde(rename = "discriminator")]
    pub discrim: String,
}

#[derive(Debug, Deserialize)]
struct BotGatewayResponse {
    #[serde(default)]
    session_start_limit: std::collections::HashMap<String, i64>,
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Synthetic response helper for locally generated answers.
    pub fn synthetic(status: StatusCode, body: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }
}

pub struct DiscordClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    ws_proxy: Option<String>,
    caches: DashMap<String, EndpointCache>,
}

impl DiscordClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(1000)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(90));

        if config.disable_http2 {
            builder = builder.http1_only();
        }
        if let Some(ip) = config.outbound_ip {
            builder = builder.local_address(ip);
        }

        let http = builder.build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: config.request_timeout,
            ws_proxy: config.ws_proxy.clone(),
            caches: DashMap::new(),
        })
    }

    /// Point the client at a different upstream. Test servers use this.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The underlying reqwest client, shared with cluster RPC and routed
    /// request forwarding.
    pub fn raw(&self) -> &reqwest::Client {
        &self.http
    }

    /// Execute one request against Discord on behalf of `identity`.
    ///
    /// Consults the endpoint cache first, applies the per-request deadline,
    /// observes the request histogram, rewrites gateway URLs, and fills the
    /// cache on allowlisted 200s.
    pub async fn execute(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: HeaderMap,
        body: Bytes,
        identity: &str,
    ) -> Result<UpstreamResponse> {
        let cacheable = method == Method::GET && cache_ttl_for(path).is_some();
        if cacheable {
            if let Some(entry) = self.cache_for(identity).get(path) {
                tracing::debug!(path = %redact(path), identity, "serving cached response");
                return Ok(UpstreamResponse {
                    status: StatusCode::OK,
                    headers: entry.response_headers(),
                    body: entry.data,
                });
            }
        }

        let url = match query {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        };

        let started = Instant::now();
        let send = self
            .http
            .request(method.clone(), &url)
            .headers(headers)
            .body(body)
            .send();

        let response = match tokio::time::timeout(self.request_timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                if err.is_timeout() {
                    return Err(ProxyError::UpstreamTimeout);
                }
                return Err(err.into());
            }
            Err(_) => return Err(ProxyError::UpstreamTimeout),
        };

        let status = response.status();
        let resp_headers = response.headers().clone();
        let mut body = response.bytes().await?;

        let mut status_label = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        if status == StatusCode::TOO_MANY_REQUESTS
            && resp_headers
                .get("x-ratelimit-scope")
                .is_some_and(|v| v == "shared")
        {
            status_label = "429 Shared".to_string();
        }
        metrics::observe_request(
            method.as_str(),
            status_label,
            metrics_path(path),
            identity.to_string(),
            started.elapsed(),
        );

        tracing::debug!(
            method = %method,
            path = %redact(path),
            status = status.as_u16(),
            "discord request"
        );

        if status == StatusCode::OK {
            if self.ws_proxy.is_some() && is_gateway_path(path) {
                body = self.rewrite_gateway_url(body)?;
            }

            if cacheable {
                let ttl = cache_ttl_for(path).expect("checked above");
                self.cache_for(identity).set(
                    path.to_string(),
                    CacheEntry::new(body.clone(), resp_headers.clone(), ttl),
                );
            }
        }

        Ok(UpstreamResponse {
            status,
            headers: resp_headers,
            body,
        })
    }

    /// Resolve the bot user behind a token. 401 means the token is invalid;
    /// transient upstream failures propagate for the caller to retry later.
    pub async fn get_bot_user(&self, token: &str) -> Result<BotUser> {
        let response = self
            .http
            .get(format!("{}/api/v9/users/@me", self.base_url))
            .header("Authorization", token)
            .send()
            .await?;

        match response.status().as_u16() {
            401 | 403 => Err(ProxyError::InvalidToken),
            429 => Err(ProxyError::TokenResolution("429 on users/@me".into())),
            500..=599 => Err(ProxyError::TokenResolution("5xx on users/@me".into())),
            _ => Ok(response.json::<BotUser>().await?),
        }
    }

    /// `max_concurrency` from the bot's `gateway/bot` response, used to size
    /// the per-token global bucket.
    pub async fn get_max_concurrency(&self, token: &str) -> Result<i64> {
        let response = self
            .http
            .get(format!("{}/api/v9/gateway/bot", self.base_url))
            .header("Authorization", token)
            .send()
            .await?;

        match response.status().as_u16() {
            401 | 403 => Err(ProxyError::InvalidToken),
            429 => Err(ProxyError::TokenResolution("429 on gateway/bot".into())),
            500..=599 => Err(ProxyError::TokenResolution("5xx on gateway/bot".into())),
            _ => {
                let gateway = response.json::<BotGatewayResponse>().await?;
                Ok(gateway
                    .session_start_limit
                    .get("max_concurrency")
                    .copied()
                    .unwrap_or(1))
            }
        }
    }

    fn cache_for(&self, identity: &str) -> dashmap::mapref::one::Ref<'_, String, EndpointCache> {
        self.caches
            .entry(identity.to_string())
            .or_default()
            .downgrade()
    }

    fn rewrite_gateway_url(&self, body: Bytes) -> Result<Bytes> {
        let ws_proxy = self.ws_proxy.as_deref().expect("checked by caller");
        let mut data: serde_json::Value = serde_json::from_slice(&body)?;
        if let Some(obj) = data.as_object_mut() {
            obj.insert(
                "url".to_string(),
                serde_json::Value::String(ws_proxy.to_string()),
            );
        }
        Ok(Bytes::from(serde_json::to_vec(&data)?))
    }
}

fn is_gateway_path(path: &str) -> bool {
    matches!(
        path,
        "/api/gateway"
            | "/api/v9/gateway"
            | "/api/v10/gateway"
            | "/api/gateway/bot"
            | "/api/v9/gateway/bot"
            | "/api/v10/gateway/bot"
    )
}

/// The identity string used for cache scoping and the metrics `clientId`
/// label: the bot's user id when resolved, otherwise derived from the token.
pub fn identity_for(token: &str, user: Option<&BotUser>) -> String {
    match user {
        Some(user) => user.id.clone(),
        None => util::client_id_from_token(token),
    }
}
