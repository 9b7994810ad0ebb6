//! Narrow response cache for a fixed set of identity-scoped endpoints.
//!
//! Only endpoints whose responses are effectively static per token are
//! cached; everything else always goes to Discord. Cached responses are
//! served with fabricated ratelimit headers so clients tracking their own
//! buckets are not starved by the missing real headers.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue};

/// Path → TTL allowlist. Unversioned and versioned forms are listed
/// explicitly so the lookup stays an exact match.
pub fn cache_ttl_for(path: &str) -> Option<Duration> {
    let minutes = match path {
        "/api/users/@me" | "/api/v9/users/@me" | "/api/v10/users/@me" => 10,
        "/api/gateway" | "/api/v9/gateway" | "/api/v10/gateway" => 60,
        "/api/gateway/bot" | "/api/v9/gateway/bot" | "/api/v10/gateway/bot" => 30,
        "/api/v9/applications/@me" | "/api/v10/applications/@me" => 5,
        _ => return None,
    };
    Some(Duration::from_secs(minutes * 60))
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Bytes,
    pub headers: HeaderMap,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    pub fn new(data: Bytes, headers: HeaderMap, ttl: Duration) -> Self {
        Self {
            data,
            headers,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }

    /// Headers to serve the cached response with: the original set plus the
    /// cache marker and fabricated bucket headers.
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert("x-cached", HeaderValue::from_static("true"));
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("5"));
        headers.insert("x-ratelimit-bucket", HeaderValue::from_static("cache"));
        headers
    }
}

/// Cache of allowlisted endpoint responses for one token identity.
#[derive(Debug, Default)]
pub struct EndpointCache {
    entries: DashMap<String, CacheEntry>,
}

impl EndpointCache {
    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(path)?;
        if entry.expired() {
            drop(entry);
            self.entries.remove(path);
            return None;
        }
        Some(entry.clone())
    }

    pub fn set(&self, path: String, entry: CacheEntry) {
        self.entries.insert(path, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_covers_versioned_forms() {
        assert!(cache_ttl_for("/api/v9/gateway/bot").is_some());
        assert!(cache_ttl_for("/api/gateway").is_some());
        assert!(cache_ttl_for("/api/v10/users/@me").is_some());
        assert!(cache_ttl_for("/api/v9/channels/1").is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = EndpointCache::default();
        cache.set(
            "/api/v9/gateway".to_string(),
            CacheEntry::new(Bytes::from_static(b"{}"), HeaderMap::new(), Duration::ZERO),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("/api/v9/gateway").is_none());
    }

    #[test]
    fn hit_carries_cache_markers() {
        let cache = EndpointCache::default();
        cache.set(
            "/api/v9/gateway".to_string(),
            CacheEntry::new(
                Bytes::from_static(b"{}"),
                HeaderMap::new(),
                Duration::from_secs(60),
            ),
        );
        let entry = cache.get("/api/v9/gateway").expect("fresh entry");
        let headers = entry.response_headers();
        assert_eq!(headers.get("x-cached").unwrap(), "true");
        assert_eq!(headers.get("x-ratelimit-bucket").unwrap(), "cache");
    }
}
