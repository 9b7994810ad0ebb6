//! Proxy core: bucket derivation, queueing, ratelimiting and clustering.
//!
//! Request flow: the [`dispatcher`] derives a bucket key per request and
//! either forwards to the owning cluster node or hands the request to the
//! local [`registry`], which owns one [`token_queue`] per token, which owns
//! one serialized [`bucket_queue`] per bucket key. Workers gate on the
//! token's [`global`] limit before every upstream dispatch.

pub mod bucket_path;
pub mod bucket_queue;
pub mod cache;
pub mod cluster;
pub mod discord;
pub mod dispatcher;
pub mod global;
pub mod headers;
pub mod leaky_bucket;
pub mod registry;
pub mod token_queue;

pub use bucket_path::{is_interaction, metrics_path, optimistic_bucket_path};
pub use bucket_queue::ProxiedRequest;
pub use cluster::{ClusterMembership, ClusterRouter, ClusterView};
pub use discord::{BotUser, DiscordClient, UpstreamResponse};
pub use dispatcher::{build_router, AppState};
pub use global::GlobalRateLimiter;
pub use headers::{RatelimitInfo, RatelimitScope};
pub use leaky_bucket::LeakyBucket;
pub use registry::QueueRegistry;
pub use token_queue::{QueueDeps, QueueKind, TokenQueue};
