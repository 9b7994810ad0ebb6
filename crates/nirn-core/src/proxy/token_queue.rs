//! Per-token queue ownership.
//!
//! A `TokenQueue` owns every bucket queue for one `Authorization` value. It
//! resolves the token's identity and global limit at construction, carries
//! the token-wide invalidation flag and global-lock word that all bucket
//! workers gate on, and sweeps idle bucket queues in the background.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::proxy::bucket_queue::{BucketQueue, ProxiedRequest, QueueItem};
use crate::proxy::cluster::ClusterRouter;
use crate::proxy::discord::{identity_for, DiscordClient, UpstreamResponse};
use crate::proxy::global::{resolve_global_limit, GlobalRateLimiter};
use crate::util::hash_crc64;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SWEEP_IDLE_CUTOFF: Duration = Duration::from_secs(10 * 60);

/// Bearer queues hold few endpoints and are short-lived; a small buffer
/// hint keeps them cheap.
const BEARER_BUFFER_HINT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Bot,
    Bearer,
    NoAuth,
    /// Sentinel for tokens that failed resolution; every item gets a 401.
    Invalid,
}

/// Shared dependencies handed to every token queue at construction.
#[derive(Clone)]
pub struct QueueDeps {
    pub client: Arc<DiscordClient>,
    pub global: Arc<GlobalRateLimiter>,
    pub router: Arc<ClusterRouter>,
    pub config: Arc<Config>,
}

/// The narrow surface bucket workers see of their owning token queue:
/// the processor dependencies plus the invalidation and global-lock words.
pub(crate) struct TokenContext {
    pub kind: QueueKind,
    /// Cache/metrics identity: bot user id, or derived from the token.
    pub identity: String,
    /// Routing hash for the token's global bucket.
    pub bot_hash: u64,
    pub global_limit: u64,
    pub disable_401_lock: bool,
    pub client: Arc<DiscordClient>,
    pub global: Arc<GlobalRateLimiter>,
    pub router: Arc<ClusterRouter>,
    invalidated: AtomicBool,
    /// 0 = unlocked, otherwise nanoseconds-since-epoch until which every
    /// bucket of this token must hold off.
    global_locked_until_ns: AtomicU64,
}

impl TokenContext {
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Block until the token-wide global lock clears. The sleeper that
    /// observes the deadline pass CAS-clears the word; losing the CAS means
    /// another response extended the lock, so re-read and keep waiting.
    pub async fn wait_global_unlock(&self) {
        loop {
            let locked_until = self.global_locked_until_ns.load(Ordering::Acquire);
            if locked_until == 0 {
                return;
            }
            let now = now_ns();
            if locked_until > now {
                tokio::time::sleep(Duration::from_nanos(locked_until - now)).await;
            }
            if self
                .global_locked_until_ns
                .compare_exchange(locked_until, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(identity = %self.identity, "unlocked global bucket");
                return;
            }
        }
    }

    /// Set the global lock to expire `reset_after` from now, keeping the
    /// monotonic maximum when a lock is already held. Returns true when this
    /// call freshly locked.
    pub fn lock_global_until_after(&self, reset_after: Duration) -> bool {
        let until = now_ns().saturating_add(reset_after.as_nanos() as u64);
        let mut current = self.global_locked_until_ns.load(Ordering::Acquire);
        loop {
            if current >= until {
                return false;
            }
            match self.global_locked_until_ns.compare_exchange_weak(
                current,
                until,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current == 0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserve one token from the token's global bucket, locally when this
    /// node owns the bucket and over RPC otherwise. Bearer globals are
    /// always local: their buckets are keyed per token, so any node's
    /// bucket enforces the same ceiling without a cross-node hop.
    pub async fn take_global(&self) -> Result<()> {
        let routed = if self.kind == QueueKind::Bearer {
            None
        } else {
            self.router.route(self.bot_hash)
        };
        match routed {
            None => {
                self.global.take(self.bot_hash, self.global_limit).await;
                Ok(())
            }
            Some(addr) => {
                self.global
                    .fire_remote(self.client.raw(), &addr, self.bot_hash, self.global_limit)
                    .await
            }
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_nanos() as u64
}

struct TokenQueueInner {
    ctx: Arc<TokenContext>,
    queues: DashMap<u64, BucketQueue>,
    buffer_hint: usize,
    destroyed: AtomicBool,
}

/// Handle to one token's queues. Clones share the same state.
#[derive(Clone)]
pub struct TokenQueue {
    inner: Arc<TokenQueueInner>,
}

impl TokenQueue {
    /// Build the queue for `token`: classify it, resolve the bot identity
    /// and global limit, and start the sweeper for bot queues. A token that
    /// fails resolution with a 401 yields the sentinel Invalid queue instead
    /// of an error.
    pub async fn new(deps: &QueueDeps, token: String) -> Result<TokenQueue> {
        let (kind, user) = if token.is_empty() {
            (QueueKind::NoAuth, None)
        } else if token.starts_with("Bearer") {
            (QueueKind::Bearer, None)
        } else {
            match deps.client.get_bot_user(&token).await {
                Ok(user) => (QueueKind::Bot, Some(user)),
                Err(ProxyError::InvalidToken) => return Ok(Self::invalid(deps)),
                Err(err) => return Err(err),
            }
        };

        let global_limit = match resolve_global_limit(
            &deps.client,
            &token,
            user.as_ref(),
            &deps.config.bot_ratelimit_overrides,
            deps.config.disable_global_ratelimit_detection,
        )
        .await
        {
            Ok(limit) => limit,
            Err(ProxyError::InvalidToken) => return Ok(Self::invalid(deps)),
            Err(err) => return Err(err),
        };

        let bot_hash = match kind {
            QueueKind::Bot => user
                .as_ref()
                .map(|u| hash_crc64(&u.id))
                .unwrap_or_default(),
            QueueKind::Bearer => hash_crc64(&token),
            _ => 0,
        };

        let identity = identity_for(&token, user.as_ref());
        let ctx = Arc::new(TokenContext {
            kind,
            identity,
            bot_hash,
            global_limit,
            disable_401_lock: deps.config.disable_401_lock,
            client: deps.client.clone(),
            global: deps.global.clone(),
            router: deps.router.clone(),
            invalidated: AtomicBool::new(false),
            global_locked_until_ns: AtomicU64::new(0),
        });

        let buffer_hint = match kind {
            QueueKind::Bearer => BEARER_BUFFER_HINT,
            _ => deps.config.buffer_size,
        };

        let queue = TokenQueue {
            inner: Arc::new(TokenQueueInner {
                ctx,
                queues: DashMap::new(),
                buffer_hint,
                destroyed: AtomicBool::new(false),
            }),
        };

        match (kind, user) {
            (QueueKind::Bot, Some(user)) => {
                tracing::info!(
                    global_limit,
                    identifier = %format!("{}#{}", user.username, user.discrim),
                    "created new queue"
                );
                // Bearer queues get destroyed wholesale by the LRU; only bot
                // queues live long enough to need sweeping.
                queue.spawn_sweeper();
            }
            _ => {
                tracing::debug!(global_limit, kind = ?kind, "created new queue");
            }
        }

        Ok(queue)
    }

    fn invalid(deps: &QueueDeps) -> TokenQueue {
        let ctx = Arc::new(TokenContext {
            kind: QueueKind::Invalid,
            identity: "InvalidTokenQueue".to_string(),
            bot_hash: 0,
            global_limit: 0,
            disable_401_lock: deps.config.disable_401_lock,
            client: deps.client.clone(),
            global: deps.global.clone(),
            router: deps.router.clone(),
            invalidated: AtomicBool::new(true),
            global_locked_until_ns: AtomicU64::new(0),
        });
        tracing::warn!("invalid token, answering 401 to all requests");
        TokenQueue {
            inner: Arc::new(TokenQueueInner {
                ctx,
                queues: DashMap::new(),
                buffer_hint: 1,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a request on the bucket queue for `bucket` and wait for its
    /// response. `QueueClosed` surfaces when the queue was destroyed while
    /// the item was in flight.
    pub async fn queue(
        &self,
        bucket: String,
        request: ProxiedRequest,
    ) -> Result<UpstreamResponse> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(ProxyError::QueueClosed);
        }

        let bucket_hash = hash_crc64(&bucket);
        let (item, rx) = QueueItem::new(request);

        let queue = self
            .inner
            .queues
            .entry(bucket_hash)
            .or_insert_with(|| {
                BucketQueue::spawn(self.inner.ctx.clone(), bucket, self.inner.buffer_hint)
            })
            .clone();

        if queue.send(item).is_err() {
            return Err(ProxyError::QueueClosed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::QueueClosed),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.ctx.kind
    }

    pub fn identity(&self) -> &str {
        &self.inner.ctx.identity
    }

    pub fn global_limit(&self) -> u64 {
        self.inner.ctx.global_limit
    }

    /// Stop accepting new items and let the bucket workers drain what they
    /// already hold. Used by bearer LRU eviction and shutdown.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
        self.inner.queues.retain(|_, queue| {
            queue.close();
            false
        });
    }

    fn spawn_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            // interval fires immediately; skip the zeroth tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.destroyed.load(Ordering::Acquire) {
                    break;
                }
                let mut swept = 0usize;
                inner.queues.retain(|_, queue| {
                    if queue.idle_for() >= SWEEP_IDLE_CUTOFF {
                        queue.close();
                        swept += 1;
                        false
                    } else {
                        true
                    }
                });
                tracing::info!(swept_entries = swept, "finished sweep");
            }
        });
    }
}
