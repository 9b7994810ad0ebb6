//! Per-token global ratelimiting, local and cross-node.
//!
//! Every token maps to one leaky bucket sized from its `gateway/bot`
//! response. In a cluster the bucket for a given bot lives on exactly one
//! node; other nodes reserve tokens through the `/nirn/global` RPC, which
//! blocks until the authoritative node has actually taken one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{ProxyError, Result};
use crate::proxy::discord::{BotUser, DiscordClient};

pub const GLOBAL_RPC_PATH: &str = "/nirn/global";
pub const BOT_HASH_HEADER: &str = "bot-hash";
pub const BOT_LIMIT_HEADER: &str = "bot-limit";

use crate::proxy::leaky_bucket::LeakyBucket;

pub struct GlobalRateLimiter {
    buckets: DashMap<u64, Arc<Mutex<LeakyBucket>>>,
}

impl GlobalRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Take one token from the bucket for `bot_hash`, sleeping through
    /// resets until one is available. Never gives up.
    pub async fn take(&self, bot_hash: u64, bot_limit: u64) {
        let bucket = self.get_or_create(bot_hash, bot_limit);
        loop {
            let denied_until = {
                let mut bucket = bucket.lock().expect("bucket mutex");
                match bucket.add(1) {
                    Ok(_) => return,
                    Err(reset) => reset,
                }
            };
            tracing::trace!(bot_hash, "global bucket exhausted, sleeping until reset");
            tokio::time::sleep_until(denied_until.into()).await;
        }
    }

    fn get_or_create(&self, bot_hash: u64, bot_limit: u64) -> Arc<Mutex<LeakyBucket>> {
        self.buckets
            .entry(bot_hash)
            .or_insert_with(|| {
                Arc::new(Mutex::new(LeakyBucket::new(
                    bot_limit,
                    Duration::from_secs(1),
                )))
            })
            .clone()
    }

    /// Reserve a global token on the authoritative node for `bot_hash`.
    /// The peer only answers 200 once its local take succeeded, so on return
    /// the caller's request is already accounted for.
    pub async fn fire_remote(
        &self,
        http: &reqwest::Client,
        addr: &str,
        bot_hash: u64,
        bot_limit: u64,
    ) -> Result<()> {
        let response = http
            .get(format!("http://{addr}{GLOBAL_RPC_PATH}"))
            .header(BOT_HASH_HEADER, bot_hash.to_string())
            .header(BOT_LIMIT_HEADER, bot_limit.to_string())
            .send()
            .await
            .map_err(|e| ProxyError::GlobalRpc(e.to_string()))?;

        if response.status().as_u16() != 200 {
            return Err(ProxyError::GlobalRpc(format!(
                "global request to {addr} failed with status {}",
                response.status()
            )));
        }
        tracing::trace!(addr, bot_hash, "got go-ahead for global");
        Ok(())
    }
}

impl Default for GlobalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the global requests/second limit for a token.
///
/// Operator overrides (by bot user id) win over everything else. Bearer
/// tokens and single-shard bots get the flat 50/s default; larger bots scale
/// with their gateway `max_concurrency`.
pub async fn resolve_global_limit(
    client: &DiscordClient,
    token: &str,
    user: Option<&BotUser>,
    overrides: &std::collections::HashMap<String, u64>,
    disable_detection: bool,
) -> Result<u64> {
    if token.is_empty() {
        return Ok(u32::MAX as u64);
    }

    if let Some(user) = user {
        if let Some(limit) = overrides.get(&user.id) {
            return Ok(*limit);
        }
    }

    if token.starts_with("Bearer") {
        return Ok(50);
    }

    if disable_detection {
        return Ok(50);
    }

    let concurrency = client.get_max_concurrency(token).await?;
    if concurrency == 1 {
        Ok(50)
    } else {
        Ok((25 * concurrency).max(500) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn take_admits_up_to_limit_without_blocking() {
        let limiter = GlobalRateLimiter::new();
        let start = Instant::now();
        for _ in 0..50 {
            limiter.take(1, 50).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn take_blocks_past_limit_until_reset() {
        let limiter = GlobalRateLimiter::new();
        for _ in 0..3 {
            limiter.take(7, 3).await;
        }
        let start = Instant::now();
        limiter.take(7, 3).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn buckets_are_independent_per_hash() {
        let limiter = GlobalRateLimiter::new();
        for _ in 0..3 {
            limiter.take(1, 3).await;
        }
        let start = Instant::now();
        limiter.take(2, 3).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
