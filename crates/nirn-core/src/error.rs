//! Unified error types for the proxy core.

use thiserror::Error;

/// Main error type for all proxy operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// Outbound request to Discord (or a cluster peer) failed at the
    /// transport level.
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Outbound request exceeded the configured per-request deadline.
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// JSON serialization/deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response carried rate-limit headers that could not be parsed.
    #[error("malformed ratelimit headers: {0}")]
    RatelimitHeaders(String),

    /// The token failed initial resolution against `users/@me`.
    #[error("invalid token")]
    InvalidToken,

    /// Token identity resolution failed for a retriable reason
    /// (429/5xx on the probe endpoints).
    #[error("token resolution failed: {0}")]
    TokenResolution(String),

    /// The bucket queue was destroyed while a send was in flight.
    /// Surfaces to the client as a synthetic 429.
    #[error("queue closed")]
    QueueClosed,

    /// The item sat in its queue past the client-supplied abort budget.
    #[error("request aborted because of ratelimits")]
    AbortedByBudget,

    /// A cross-node global-limit RPC failed.
    #[error("global ratelimit rpc failed: {0}")]
    GlobalRpc(String),

    /// Cluster membership failure.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Configuration loading or validation failed.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
