//! Parsing of Discord ratelimit response headers.

use std::time::Duration;

use http::HeaderMap;

use crate::error::{ProxyError, Result};

/// Which limit a 429 was counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatelimitScope {
    User,
    Shared,
    Global,
}

impl RatelimitScope {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "shared" => Some(Self::Shared),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// Ratelimit state extracted from one upstream response.
#[derive(Debug, Clone, Default)]
pub struct RatelimitInfo {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    /// Seconds until the bucket resets, millisecond precision preserved.
    pub reset_after: Option<Duration>,
    pub is_global: bool,
    pub scope: Option<RatelimitScope>,
}

impl RatelimitInfo {
    /// Extract limit/remaining/reset/global/scope from response headers.
    ///
    /// `x-ratelimit-reset-after` is authoritative only for `user`-scoped
    /// responses; shared buckets lie in it, and globals omit it entirely, so
    /// `retry-after` is used when the header is absent or the scope is not
    /// `user`.
    pub fn parse(headers: &HeaderMap) -> Result<Self> {
        let scope = header_str(headers, "x-ratelimit-scope").and_then(RatelimitScope::parse);
        let is_global = header_str(headers, "x-ratelimit-global") == Some("true");

        let mut reset_raw = header_str(headers, "x-ratelimit-reset-after");
        let untrustworthy_scope = scope.is_some() && scope != Some(RatelimitScope::User);
        if reset_raw.is_none() || untrustworthy_scope {
            if let Some(retry) = header_str(headers, "retry-after") {
                reset_raw = Some(retry);
            }
        }

        let reset_after = match reset_raw {
            Some(raw) => {
                let secs: f64 = raw.parse().map_err(|_| {
                    ProxyError::RatelimitHeaders(format!("bad reset-after value: {raw}"))
                })?;
                // Truncate to ms like the headers themselves do.
                Some(Duration::from_millis((secs * 1000.0) as u64))
            }
            None => None,
        };

        if is_global {
            return Ok(Self {
                limit: None,
                remaining: None,
                reset_after,
                is_global,
                scope,
            });
        }

        let limit = match header_str(headers, "x-ratelimit-limit") {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                ProxyError::RatelimitHeaders(format!("bad limit value: {raw}"))
            })?),
            None => {
                return Ok(Self {
                    limit: None,
                    remaining: None,
                    reset_after,
                    is_global,
                    scope,
                })
            }
        };

        let remaining = match header_str(headers, "x-ratelimit-remaining") {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                ProxyError::RatelimitHeaders(format!("bad remaining value: {raw}"))
            })?),
            None => None,
        };

        Ok(Self {
            limit,
            remaining,
            reset_after,
            is_global,
            scope,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                http::HeaderName::from_bytes(k.as_bytes()).expect("name"),
                HeaderValue::from_str(v).expect("value"),
            );
        }
        map
    }

    #[test]
    fn parses_standard_bucket_headers() {
        let info = RatelimitInfo::parse(&headers(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset-after", "0.473"),
        ]))
        .expect("parse");
        assert_eq!(info.limit, Some(5));
        assert_eq!(info.remaining, Some(0));
        assert_eq!(info.reset_after, Some(Duration::from_millis(473)));
        assert!(!info.is_global);
    }

    #[test]
    fn global_skips_limit_parsing() {
        let info = RatelimitInfo::parse(&headers(&[
            ("x-ratelimit-global", "true"),
            ("retry-after", "1.5"),
        ]))
        .expect("parse");
        assert!(info.is_global);
        assert_eq!(info.reset_after, Some(Duration::from_millis(1500)));
        assert_eq!(info.limit, None);
    }

    #[test]
    fn shared_scope_prefers_retry_after() {
        let info = RatelimitInfo::parse(&headers(&[
            ("x-ratelimit-scope", "shared"),
            ("x-ratelimit-reset-after", "600"),
            ("retry-after", "2"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "0"),
        ]))
        .expect("parse");
        assert_eq!(info.scope, Some(RatelimitScope::Shared));
        assert_eq!(info.reset_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn missing_headers_yield_empty_info() {
        let info = RatelimitInfo::parse(&HeaderMap::new()).expect("parse");
        assert_eq!(info.limit, None);
        assert_eq!(info.remaining, None);
        assert_eq!(info.reset_after, None);
        assert!(!info.is_global);
    }

    #[test]
    fn malformed_reset_is_an_error() {
        assert!(RatelimitInfo::parse(&headers(&[(
            "x-ratelimit-reset-after",
            "soon"
        )]))
        .is_err());
    }
}
