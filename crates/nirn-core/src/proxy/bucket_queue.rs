//! FIFO serialization queue for one ratelimit bucket.
//!
//! Each bucket key gets exactly one worker task. Enqueuers push onto a
//! mutex-guarded deque and the worker processes items strictly in order,
//! holding at most one upstream request in flight per bucket at any moment.
//! The worker gates every item on the token's global lock and global bucket,
//! parses ratelimit headers off the response, and sleeps through bucket
//! resets before admitting the next item.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::{oneshot, Notify};

use crate::error::{ProxyError, Result};
use crate::logging::redact;
use crate::metrics;
use crate::proxy::bucket_path::is_interaction;
use crate::proxy::discord::UpstreamResponse;
use crate::proxy::headers::{RatelimitInfo, RatelimitScope};
use crate::proxy::token_queue::{QueueKind, TokenContext};

const DEAD_WEBHOOK_BODY: &str = "{\"message\": \"Unknown Webhook\", \"code\": 10015}";
const UNAUTHORIZED_BODY: &str = "{\"message\": \"401: Unauthorized\", \"code\": 0}";

/// One client request, ready to be dispatched upstream.
#[derive(Debug)]
pub struct ProxiedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Client-supplied abort budget in seconds.
    pub abort_after: Option<u64>,
}

pub(crate) struct QueueItem {
    pub request: ProxiedRequest,
    pub enqueued_at: Instant,
    tx: oneshot::Sender<Result<UpstreamResponse>>,
}

impl QueueItem {
    pub fn new(request: ProxiedRequest) -> (Self, oneshot::Receiver<Result<UpstreamResponse>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                enqueued_at: Instant::now(),
                tx,
            },
            rx,
        )
    }

    fn respond(self, result: Result<UpstreamResponse>) {
        // The client may have gone away; nothing to do then.
        let _ = self.tx.send(result);
    }
}

struct QueueState {
    items: VecDeque<QueueItem>,
    closed: bool,
    last_used: Instant,
}

struct QueueShared {
    bucket: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl QueueShared {
    /// Next item in FIFO order; `None` once the queue is closed and drained.
    async fn pop(&self) -> Option<QueueItem> {
        loop {
            {
                let mut state = self.state.lock().expect("queue mutex");
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Answer every pending item whose abort budget the coming reset sleep
    /// would blow, keeping the rest in order.
    fn abort_over_budget(&self, waiting_until: Instant) {
        let mut state = self.state.lock().expect("queue mutex");
        let pending = std::mem::take(&mut state.items);
        for item in pending {
            let would_wait = waiting_until.saturating_duration_since(item.enqueued_at);
            match item.request.abort_after {
                Some(budget) if would_wait > Duration::from_secs(budget) => {
                    item.respond(Err(ProxyError::AbortedByBudget));
                }
                _ => state.items.push_back(item),
            }
        }
    }
}

/// Handle to one bucket's queue. Cheap to clone; the worker task runs until
/// the queue is closed and drained.
#[derive(Clone)]
pub struct BucketQueue {
    shared: Arc<QueueShared>,
}

impl BucketQueue {
    pub(crate) fn spawn(ctx: Arc<TokenContext>, bucket: String, capacity_hint: usize) -> Self {
        let shared = Arc::new(QueueShared {
            bucket,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity_hint),
                closed: false,
                last_used: Instant::now(),
            }),
            notify: Notify::new(),
        });
        tokio::spawn(run_worker(ctx, shared.clone()));
        Self { shared }
    }

    /// Enqueue an item. Fails with the item handed back when the queue was
    /// concurrently closed; callers turn that into a synthetic 429.
    pub(crate) fn send(&self, item: QueueItem) -> std::result::Result<(), QueueItem> {
        {
            let mut state = self.shared.state.lock().expect("queue mutex");
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
            state.last_used = Instant::now();
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Stop accepting new items. The worker drains what is already buffered
    /// and then terminates.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock().expect("queue mutex");
        state.closed = true;
        drop(state);
        self.shared.notify.notify_one();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.shared
            .state
            .lock()
            .expect("queue mutex")
            .last_used
            .elapsed()
    }
}

fn is_reaction_bucket(bucket: &str) -> bool {
    bucket.starts_with("/channels/")
        && (bucket.ends_with("/reactions/!modify") || bucket.ends_with("/reactions/!/!"))
}

async fn run_worker(ctx: Arc<TokenContext>, shared: Arc<QueueShared>) {
    // Previous response stats, only used to give 429 logs context.
    let mut prev_remaining: Option<i64> = None;
    let mut prev_reset: Option<Duration> = None;
    // Sticky fail-fast flag for webhooks deleted upstream.
    let mut dead_webhook = false;

    while let Some(item) = shared.pop().await {
        if dead_webhook {
            item.respond(Ok(UpstreamResponse::synthetic(
                StatusCode::NOT_FOUND,
                DEAD_WEBHOOK_BODY,
            )));
            continue;
        }

        if ctx.is_invalidated() {
            item.respond(Ok(UpstreamResponse::synthetic(
                StatusCode::UNAUTHORIZED,
                UNAUTHORIZED_BODY,
            )));
            continue;
        }

        ctx.wait_global_unlock().await;

        if !matches!(ctx.kind, QueueKind::NoAuth) {
            if let Err(err) = ctx.take_global().await {
                tracing::error!(
                    error = %err,
                    bucket = %redact(&shared.bucket),
                    "failed to reserve global token"
                );
                metrics::inc_error();
                item.respond(Err(err));
                continue;
            }
        }

        let request = &item.request;
        let result = ctx
            .client
            .execute(
                &request.method,
                &request.path,
                request.query.as_deref(),
                request.headers.clone(),
                request.body.clone(),
                &ctx.identity,
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                item.respond(Err(err));
                continue;
            }
        };

        let info = match RatelimitInfo::parse(&response.headers) {
            Ok(info) => info,
            Err(err) => {
                item.respond(Err(err));
                continue;
            }
        };

        if info.is_global {
            let reset = info.reset_after.unwrap_or_default();
            if ctx.lock_global_until_after(reset) {
                tracing::warn!(
                    reset_after = ?reset,
                    bucket = %redact(&shared.bucket),
                    "global ratelimit reached, locking"
                );
            }
        }

        let status = response.status;
        let request_path = request.path.clone();
        let request_method = request.method.clone();
        item.respond(Ok(response));

        if status == StatusCode::NOT_FOUND
            && shared.bucket.starts_with("/webhooks/")
            && !is_interaction(&request_path)
        {
            tracing::info!(
                bucket = %redact(&shared.bucket),
                route = %redact(&request_path),
                method = %request_method,
                "setting fail-fast 404 for webhook"
            );
            dead_webhook = true;
        }

        if status == StatusCode::UNAUTHORIZED
            && !is_interaction(&request_path)
            && !matches!(ctx.kind, QueueKind::NoAuth)
            && !ctx.disable_401_lock
        {
            tracing::warn!(identity = %ctx.identity, "upstream 401, invalidating token queue");
            ctx.invalidate();
        }

        let is_429 = status == StatusCode::TOO_MANY_REQUESTS;
        if is_429 {
            if info.scope == Some(RatelimitScope::Shared) && is_reaction_bucket(&shared.bucket) {
                // Someone else consumed the shared reaction bucket; backing
                // off locally would stall reactions that are still allowed.
                prev_remaining = info.remaining;
                prev_reset = info.reset_after;
                continue;
            }

            if matches!(
                info.scope,
                Some(RatelimitScope::User) | Some(RatelimitScope::Global)
            ) {
                tracing::warn!(
                    bucket = %redact(&shared.bucket),
                    route = %redact(&request_path),
                    method = %request_method,
                    prev_remaining,
                    prev_reset_ms = prev_reset.map(|d| d.as_millis() as u64),
                    remaining = info.remaining,
                    reset_after = ?info.reset_after,
                    is_global = info.is_global,
                    "unexpected 429"
                );
            }
        }

        if info.remaining == Some(0) || is_429 {
            let reset = info.reset_after.unwrap_or_default();
            let waiting_until = Instant::now() + reset;
            shared.abort_over_budget(waiting_until);
            tokio::time::sleep(reset).await;
        }

        prev_remaining = info.remaining;
        prev_reset = info.reset_after;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaction_buckets_are_recognized() {
        assert!(is_reaction_bucket(
            "/channels/872712139712913438/messages/!/reactions/!modify"
        ));
        assert!(is_reaction_bucket(
            "/channels/872712139712913438/messages/!/reactions/!/!"
        ));
        assert!(!is_reaction_bucket(
            "/channels/872712139712913438/messages/!"
        ));
        assert!(!is_reaction_bucket("/guilds/!/channels"));
    }

    #[test]
    fn send_to_closed_queue_hands_item_back() {
        let request = ProxiedRequest {
            method: Method::GET,
            path: "/api/v9/users/@me".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            abort_after: None,
        };
        let shared = Arc::new(QueueShared {
            bucket: "/users/@me".to_string(),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                last_used: Instant::now(),
            }),
            notify: Notify::new(),
        });
        let queue = BucketQueue { shared };
        queue.close();

        let (item, _rx) = QueueItem::new(request);
        assert!(queue.send(item).is_err());
    }

    #[test]
    fn abort_sweep_answers_only_over_budget_items() {
        let shared = Arc::new(QueueShared {
            bucket: "/channels/1/messages".to_string(),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                last_used: Instant::now(),
            }),
            notify: Notify::new(),
        });

        let make = |abort_after| {
            QueueItem::new(ProxiedRequest {
                method: Method::GET,
                path: "/api/v9/channels/1/messages".to_string(),
                query: None,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                abort_after,
            })
        };

        let (tight, mut tight_rx) = make(Some(1));
        let (loose, mut loose_rx) = make(Some(600));
        let (unbounded, mut unbounded_rx) = make(None);
        {
            let mut state = shared.state.lock().unwrap();
            state.items.push_back(tight);
            state.items.push_back(loose);
            state.items.push_back(unbounded);
        }

        shared.abort_over_budget(Instant::now() + Duration::from_secs(5));

        match tight_rx.try_recv() {
            Ok(Err(ProxyError::AbortedByBudget)) => {}
            other => panic!("expected aborted item, got {other:?}"),
        }
        assert!(loose_rx.try_recv().is_err());
        assert!(unbounded_rx.try_recv().is_err());
        assert_eq!(shared.state.lock().unwrap().items.len(), 2);
    }
}
