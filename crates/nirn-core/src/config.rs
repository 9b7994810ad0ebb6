//! Environment-variable configuration.
//!
//! Every key has a default; malformed values are hard errors so a typo in a
//! deployment manifest fails fast instead of silently running misconfigured.

use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port for client + internal HTTP.
    pub port: u16,
    /// Listen address.
    pub bind_ip: IpAddr,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    pub enable_metrics: bool,
    /// Accepted for compatibility; profiling is not wired up.
    pub enable_pprof: bool,
    pub log_level: String,
    /// Per-bucket FIFO capacity hint.
    pub buffer_size: usize,
    /// Bind outbound connections to this local IP.
    pub outbound_ip: Option<IpAddr>,
    /// Per-request upstream deadline.
    pub request_timeout: Duration,
    pub cluster_port: u16,
    pub cluster_members: Vec<String>,
    pub cluster_dns: Option<String>,
    /// Overrides the gossip node name.
    pub node_name: Option<String>,
    /// Bearer LRU capacity.
    pub max_bearer_count: usize,
    /// Force HTTP/1.1 for outbound requests.
    pub disable_http2: bool,
    /// Per-bot global limit overrides, keyed by bot user id.
    pub bot_ratelimit_overrides: HashMap<String, u64>,
    /// Default abort budget in seconds; `None` means never abort.
    pub ratelimit_abort_after: Option<u64>,
    /// Disable the sticky-401 token invalidation behavior.
    pub disable_401_lock: bool,
    /// Translate upstream timeouts into synthetic 429s instead of 408s.
    pub ratelimit_over_408: bool,
    /// Skip the gateway/bot probe and assume a global limit of 50.
    pub disable_global_ratelimit_detection: bool,
    /// Substitute this URL into gateway responses.
    pub ws_proxy: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let abort_after = env_parse::<i64>("RATELIMIT_ABORT_AFTER", -1)?;
        Ok(Self {
            port: env_parse("PORT", 8080)?,
            bind_ip: env_parse("BIND_IP", IpAddr::from_str("0.0.0.0").expect("literal"))?,
            metrics_port: env_parse("METRICS_PORT", 9000)?,
            enable_metrics: env_bool("ENABLE_METRICS", true)?,
            enable_pprof: env_bool("ENABLE_PPROF", false)?,
            log_level: env_get("LOG_LEVEL", "info"),
            buffer_size: env_parse("BUFFER_SIZE", 50)?,
            outbound_ip: env_parse_opt("OUTBOUND_IP")?,
            request_timeout: Duration::from_millis(env_parse("REQUEST_TIMEOUT", 5000)?),
            cluster_port: env_parse("CLUSTER_PORT", 7946)?,
            cluster_members: env_list("CLUSTER_MEMBERS"),
            cluster_dns: env_opt("CLUSTER_DNS"),
            node_name: env_opt("NODE_NAME"),
            max_bearer_count: env_parse("MAX_BEARER_COUNT", 1024)?,
            disable_http2: env_bool("DISABLE_HTTP_2", true)?,
            bot_ratelimit_overrides: parse_global_overrides(&env_get(
                "BOT_RATELIMIT_OVERRIDES",
                "",
            ))?,
            ratelimit_abort_after: if abort_after < 0 {
                None
            } else {
                Some(abort_after as u64)
            },
            disable_401_lock: env_bool("DISABLE_401_LOCK", false)?,
            ratelimit_over_408: env_bool("RATELIMIT_OVER_408", false)?,
            disable_global_ratelimit_detection: env_bool(
                "DISABLE_GLOBAL_RATELIMIT_DETECTION",
                false,
            )?,
            ws_proxy: env_opt("WS_PROXY"),
        })
    }

    /// Whether any cluster bootstrap source is configured.
    pub fn cluster_enabled(&self) -> bool {
        !self.cluster_members.is_empty() || self.cluster_dns.is_some()
    }
}

fn env_get(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    env_opt(name)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env_opt(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ProxyError::Config(format!("failed to parse {name}={raw}"))),
        None => Ok(default),
    }
}

fn env_parse_opt<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_opt(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ProxyError::Config(format!("failed to parse {name}={raw}"))),
        None => Ok(None),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env_opt(name).as_deref() {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(ProxyError::Config(format!(
            "expected true or false for {name}, got {other}"
        ))),
    }
}

/// Format: `<bot_id>:<global_limit>,<bot_id>:<global_limit>`
fn parse_global_overrides(raw: &str) -> Result<HashMap<String, u64>> {
    let mut map = HashMap::new();
    if raw.is_empty() {
        return Ok(map);
    }
    for entry in raw.split(',') {
        let (id, limit) = entry.split_once(':').ok_or_else(|| {
            ProxyError::Config(format!("invalid bot ratelimit override: {entry}"))
        })?;
        let limit: u64 = limit.parse().map_err(|_| {
            ProxyError::Config(format!("invalid bot ratelimit override limit: {entry}"))
        })?;
        map.insert(id.to_string(), limit);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse_pairs() {
        let map = parse_global_overrides("123:500,456:1000").expect("valid");
        assert_eq!(map.get("123"), Some(&500));
        assert_eq!(map.get("456"), Some(&1000));
    }

    #[test]
    fn overrides_reject_malformed() {
        assert!(parse_global_overrides("123").is_err());
        assert!(parse_global_overrides("123:abc").is_err());
    }

    #[test]
    fn empty_overrides_are_empty() {
        assert!(parse_global_overrides("").expect("ok").is_empty());
    }
}
