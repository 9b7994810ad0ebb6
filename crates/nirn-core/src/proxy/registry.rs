//! Token → queue registry.
//!
//! Bot and no-auth queues live forever in an unbounded map; bearer queues
//! sit in an LRU whose evictions destroy the queue asynchronously. First
//! requests for the same token race through a per-token creation lock so
//! only one identity resolution hits Discord.

use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::proxy::token_queue::{QueueDeps, TokenQueue};

pub struct QueueRegistry {
    deps: QueueDeps,
    bot_queues: DashMap<String, TokenQueue>,
    bearer_queues: Mutex<LruCache<String, TokenQueue>>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl QueueRegistry {
    pub fn new(deps: QueueDeps) -> Self {
        let capacity = NonZeroUsize::new(deps.config.max_bearer_count.max(1))
            .expect("max(1) is nonzero");
        Self {
            deps,
            bot_queues: DashMap::new(),
            bearer_queues: Mutex::new(LruCache::new(capacity)),
            creation_locks: DashMap::new(),
        }
    }

    /// Look up or build the queue for `token` (the raw `Authorization`
    /// header value; empty for unauthenticated requests).
    pub async fn get_or_create(&self, token: &str) -> Result<TokenQueue> {
        if token.starts_with("Bearer") {
            self.get_or_create_bearer(token).await
        } else {
            self.get_or_create_bot(token).await
        }
    }

    async fn get_or_create_bot(&self, token: &str) -> Result<TokenQueue> {
        if let Some(queue) = self.bot_queues.get(token) {
            return Ok(queue.clone());
        }

        let lock = self.creation_lock(token);
        let _guard = lock.lock().await;
        // Another request may have built it while we waited for the lock.
        if let Some(queue) = self.bot_queues.get(token) {
            return Ok(queue.clone());
        }

        let queue = TokenQueue::new(&self.deps, token.to_string()).await?;
        self.bot_queues.insert(token.to_string(), queue.clone());
        self.creation_locks.remove(token);
        Ok(queue)
    }

    async fn get_or_create_bearer(&self, token: &str) -> Result<TokenQueue> {
        if let Some(queue) = self.bearer_queues.lock().await.get(token) {
            return Ok(queue.clone());
        }

        let lock = self.creation_lock(token);
        let _guard = lock.lock().await;
        if let Some(queue) = self.bearer_queues.lock().await.get(token) {
            return Ok(queue.clone());
        }

        let queue = TokenQueue::new(&self.deps, token.to_string()).await?;
        let evicted = self
            .bearer_queues
            .lock()
            .await
            .push(token.to_string(), queue.clone());
        if let Some((evicted_token, evicted_queue)) = evicted {
            if evicted_token != token {
                tracing::debug!("bearer lru full, destroying evicted queue");
                // Eviction must not block the insert path; the evicted
                // queue drains its buffered items in the background.
                tokio::spawn(async move { evicted_queue.destroy() });
            }
        }
        self.creation_locks.remove(token);
        Ok(queue)
    }

    fn creation_lock(&self, token: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of live bot/no-auth queues, for logging.
    pub fn bot_queue_count(&self) -> usize {
        self.bot_queues.len()
    }
}
