//! Logging setup and webhook token redaction.

use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::{fmt, EnvFilter};

/// Webhook and interaction tokens appear as a long base64-ish segment right
/// after a snowflake path segment. Everything logged through a path field
/// goes through [`redact`] first so tokens never reach log storage.
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/\d{17,26}/)[A-Za-z0-9\-_]{63,}").expect("static regex")
});

/// Initialize the global tracing subscriber.
///
/// `LOG_LEVEL` style level names are accepted; `RUST_LOG` wins when set.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Replace webhook/interaction tokens in a loggable path with `:token`.
pub fn redact(path: &str) -> String {
    TOKEN_REGEX.replace_all(path, "$1:token").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_webhook_token() {
        let path = "/api/v9/webhooks/203039963636301824/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert_eq!(
            redact(path),
            "/api/v9/webhooks/203039963636301824/:token"
        );
    }

    #[test]
    fn leaves_short_segments_alone() {
        let path = "/api/v9/channels/203039963636301824/messages";
        assert_eq!(redact(path), path);
    }

    #[test]
    fn redacts_mid_path_tokens() {
        let token = "B".repeat(70);
        let path = format!("/api/v9/webhooks/203039963636301824/{token}/messages/@original");
        assert_eq!(
            redact(&path),
            "/api/v9/webhooks/203039963636301824/:token/messages/@original"
        );
    }
}
