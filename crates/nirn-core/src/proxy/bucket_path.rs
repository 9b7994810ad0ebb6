//! Optimistic bucket path derivation.
//!
//! Predicts which Discord ratelimit bucket a request will consume from its
//! URL and method alone, before any response headers have been seen. The
//! derived key is stable across concrete ids for routes that share a bucket,
//! and anchors on the major resource id for routes that do not.

use std::time::{Duration, SystemTime};

use base64::Engine;

use crate::util::snowflake_created_at;

const MAJOR_CHANNELS: &str = "channels";
const MAJOR_GUILDS: &str = "guilds";
const MAJOR_WEBHOOKS: &str = "webhooks";
const MAJOR_INVITES: &str = "invites";
const MAJOR_INTERACTIONS: &str = "interactions";

// base64 for "interaction:"
const INTERACTION_B64_PREFIX: &str = "aW50ZXJhY3Rpb246";

/// Snowflakes are 17-20 ASCII digits in practice.
pub fn is_snowflake(s: &str) -> bool {
    (17..=20).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_numeric(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

/// Strip the `/api/` or `/api/vN/` prefix and the query string.
fn strip_api_prefix(url: &str) -> &str {
    let clean = url.split('?').next().unwrap_or(url);
    if let Some(rest) = clean.strip_prefix("/api/v") {
        // skip the version number up to the next slash
        match rest.find('/') {
            Some(i) => &rest[i + 1..],
            None => "",
        }
    } else if let Some(rest) = clean.strip_prefix("/api/") {
        rest
    } else {
        clean.trim_start_matches('/')
    }
}

/// Derive the canonical bucket key for `(url, method)`.
///
/// The output always starts with `/` and never retains the `/api` prefix.
pub fn optimistic_bucket_path(url: &str, method: &str) -> String {
    let clean = strip_api_prefix(url);
    let parts: Vec<&str> = clean.split('/').collect();
    let num_parts = parts.len();

    if num_parts <= 1 {
        return format!("/{clean}");
    }

    let mut bucket = String::with_capacity(clean.len() + 1);
    bucket.push('/');

    let curr_major;
    match parts[0] {
        MAJOR_CHANNELS => {
            if num_parts == 2 {
                // All /channels/:id requests share one Discord bucket
                // regardless of the id.
                return "/channels/!".to_string();
            }
            bucket.push_str(MAJOR_CHANNELS);
            bucket.push('/');
            bucket.push_str(parts[1]);
            curr_major = MAJOR_CHANNELS;
        }
        MAJOR_INVITES => {
            bucket.push_str(MAJOR_INVITES);
            bucket.push_str("/!");
            curr_major = MAJOR_INVITES;
        }
        MAJOR_GUILDS if num_parts == 3 && parts[2] == "channels" => {
            // guilds/:id/channels shares one bucket across all guilds
            return format!("/{MAJOR_GUILDS}/!/channels");
        }
        MAJOR_INTERACTIONS if num_parts == 4 && parts[3] == "callback" => {
            return format!("/{MAJOR_INTERACTIONS}/{}/!/callback", parts[1]);
        }
        major => {
            bucket.push_str(major);
            bucket.push('/');
            bucket.push_str(parts[1]);
            curr_major = major;
        }
    }

    if num_parts == 2 {
        return bucket;
    }

    // The major + id are accounted for; strip remaining snowflakes, emoji
    // names and webhook/interaction tokens.
    for (idx, part) in parts.iter().enumerate().skip(2) {
        if is_snowflake(part) {
            // Deleting old or very fresh messages falls into separate buckets.
            if curr_major == MAJOR_CHANNELS && parts[idx - 1] == "messages" && method == "DELETE" {
                if let Some(created_at) = snowflake_created_at(part) {
                    let now = SystemTime::now();
                    if created_at < now - Duration::from_secs(14 * 24 * 60 * 60) {
                        bucket.push_str("/!14dmsg");
                        continue;
                    }
                    if created_at > now - Duration::from_secs(10) {
                        bucket.push_str("/!10smsg");
                        continue;
                    }
                }
            }
            bucket.push_str("/!");
            continue;
        }

        if curr_major == MAJOR_CHANNELS && *part == "reactions" {
            // Reaction put/delete fall under a different bucket from the
            // other reaction endpoints.
            if method == "PUT" || method == "DELETE" {
                bucket.push_str("/reactions/!modify");
                break;
            }
            // Everything else shares one bucket, so the trailing
            // emoji/userid combo is irrelevant.
            bucket.push_str("/reactions/!/!");
            break;
        }

        if part.len() >= 64 {
            if !part.starts_with(INTERACTION_B64_PREFIX) {
                // Webhook or interaction token
                bucket.push_str("/!");
                continue;
            }

            // Interaction tokens encode "interaction:<id>:..." — extract the
            // id so follow-ups to one interaction group together.
            let mut padded = (*part).to_string();
            let rem = padded.len() % 4;
            if rem != 0 {
                padded.push_str(&"=".repeat(4 - rem));
            }
            let interaction_id = base64::engine::general_purpose::STANDARD
                .decode(&padded)
                .ok()
                .and_then(|raw| String::from_utf8(raw).ok())
                .and_then(|s| s.split(':').nth(1).map(str::to_string))
                .unwrap_or_else(|| "Unknown".to_string());
            bucket.push('/');
            bucket.push_str(&interaction_id);
            continue;
        }

        bucket.push('/');
        bucket.push_str(part);
    }

    bucket
}

/// Low-cardinality route label for metrics, derived from the bucket key by
/// additionally collapsing any purely numeric segment.
pub fn metrics_path(url: &str) -> String {
    let route = optimistic_bucket_path(url, "");

    if route.starts_with("/invite/!") {
        return "/invite/!".to_string();
    }

    let mut path = String::with_capacity(route.len());
    for part in route.split('/') {
        if part.is_empty() {
            continue;
        }
        if is_numeric(part) {
            path.push_str("/!");
        } else {
            path.push('/');
            path.push_str(part);
        }
    }

    // Prometheus only supports utf-8; the derivation is byte-oriented so a
    // client can smuggle invalid runes into the label otherwise.
    if path.chars().any(|c| c == char::REPLACEMENT_CHARACTER) {
        path = path.replace(char::REPLACEMENT_CHARACTER, "@");
    }
    path
}

/// A URL is interaction-shaped when any path segment exceeds 128 bytes.
/// Interaction endpoints are ratelimited differently from webhooks even
/// though they share the `/webhooks/` prefix.
pub fn is_interaction(url: &str) -> bool {
    let clean = url.split('?').next().unwrap_or(url);
    clean.split('/').any(|p| p.len() > 128)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snowflake_of_age(age: Duration) -> String {
        let now_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock after epoch")
            .as_millis() as u64;
        let ts = now_ms - age.as_millis() as u64 - crate::util::DISCORD_EPOCH_MS;
        (ts << 22).to_string()
    }

    #[test]
    fn bucket_path_table() {
        let cases = [
            // Guild major
            ("/api/v9/guilds/203039963636301824", "GET", "/guilds/203039963636301824"),
            // Channel major
            ("/api/v8/channels/203039963636301824", "GET", "/channels/!"),
            (
                "/api/v7/channels/203039963636301824/pins",
                "GET",
                "/channels/203039963636301824/pins",
            ),
            (
                "/api/v6/channels/872712139712913438/messages/872712150509047809/reactions/%F0%9F%98%8B",
                "GET",
                "/channels/872712139712913438/messages/!/reactions/!/!",
            ),
            (
                "/api/v5/channels/872712139712913438/messages/872712150509047809/reactions/PandaOhShit:863985751205085195",
                "GET",
                "/channels/872712139712913438/messages/!/reactions/!/!",
            ),
            (
                "/api/v9/channels/872712139712913438/messages/872712150509047809/reactions/name:863985751205085195/@me",
                "PUT",
                "/channels/872712139712913438/messages/!/reactions/!modify",
            ),
            (
                "/api/v9/channels/872712139712913438/messages/872712150509047809/reactions/name:863985751205085195/203039963636301824",
                "DELETE",
                "/channels/872712139712913438/messages/!/reactions/!modify",
            ),
            // Hooks major
            ("/api/v10/webhooks/203039963636301824", "GET", "/webhooks/203039963636301824"),
            // Invites collapse entirely
            ("/api/v9/invites/dcode", "GET", "/invites/!"),
            // Guild channel list shares one bucket across guilds
            ("/api/v9/guilds/203039963636301824/channels", "GET", "/guilds/!/channels"),
            // Interaction callback keeps the interaction id
            (
                "/api/v9/interactions/1012347283312629882/averyveryverylongtoken/callback",
                "POST",
                "/interactions/1012347283312629882/!/callback",
            ),
            // No known major
            ("/api/v9/invalid/203039963636301824", "GET", "/invalid/203039963636301824"),
            (
                "/api/v9/invalid/203039963636301824/route/203039963636301824",
                "GET",
                "/invalid/203039963636301824/route/!",
            ),
            // Unversioned routes parse identically
            ("/api/channels/203039963636301824", "GET", "/channels/!"),
            ("/api/gateway/bot", "GET", "/gateway/bot"),
            ("/api/v9/users/@me", "GET", "/users/@me"),
        ];
        for (path, method, want) in cases {
            assert_eq!(
                optimistic_bucket_path(path, method),
                want,
                "{method} {path}"
            );
        }
    }

    #[test]
    fn webhook_token_is_stripped() {
        let token = "a".repeat(68);
        let path = format!("/api/v9/webhooks/203039963636301824/{token}");
        assert_eq!(
            optimistic_bucket_path(&path, "POST"),
            "/webhooks/203039963636301824/!"
        );
    }

    #[test]
    fn snowflake_boundary_lengths() {
        assert!(is_snowflake(&"1".repeat(17)));
        assert!(is_snowflake(&"1".repeat(20)));
        assert!(!is_snowflake(&"1".repeat(16)));
        assert!(!is_snowflake(&"1".repeat(21)));
        assert!(!is_snowflake("1234567890123456a"));
    }

    #[test]
    fn old_message_delete_gets_own_bucket() {
        let id = snowflake_of_age(Duration::from_secs(15 * 24 * 60 * 60));
        let path = format!("/api/v9/channels/872712139712913438/messages/{id}");
        assert_eq!(
            optimistic_bucket_path(&path, "DELETE"),
            "/channels/872712139712913438/messages/!14dmsg"
        );
        // Only DELETE is special-cased
        assert_eq!(
            optimistic_bucket_path(&path, "GET"),
            "/channels/872712139712913438/messages/!"
        );
    }

    #[test]
    fn fresh_message_delete_gets_own_bucket() {
        let id = snowflake_of_age(Duration::from_secs(2));
        let path = format!("/api/v9/channels/872712139712913438/messages/{id}");
        assert_eq!(
            optimistic_bucket_path(&path, "DELETE"),
            "/channels/872712139712913438/messages/!10smsg"
        );
    }

    #[test]
    fn interaction_token_extracts_id() {
        // base64("interaction:1012347283312629882:extradata...") padded out
        // past 64 chars the way real interaction tokens are.
        let raw = "interaction:1012347283312629882:somemoredatathatpadsthetokenoutwell";
        let token = base64::engine::general_purpose::STANDARD_NO_PAD.encode(raw);
        assert!(token.len() >= 64);
        let path = format!("/api/v9/webhooks/203039963636301824/{token}");
        assert_eq!(
            optimistic_bucket_path(&path, "POST"),
            "/webhooks/203039963636301824/1012347283312629882"
        );
    }

    #[test]
    fn metrics_path_collapses_numeric_segments() {
        assert_eq!(
            metrics_path("/api/v9/guilds/203039963636301824"),
            "/guilds/!"
        );
        assert_eq!(
            metrics_path("/api/v7/channels/203039963636301824/pins"),
            "/channels/!/pins"
        );
    }

    #[test]
    fn interaction_heuristic_is_segment_length() {
        let long = "x".repeat(129);
        assert!(is_interaction(&format!("/api/v9/webhooks/1/{long}")));
        let short = "x".repeat(128);
        assert!(!is_interaction(&format!("/api/v9/webhooks/1/{short}")));
    }

    #[test]
    fn derived_paths_never_keep_api_prefix() {
        for url in [
            "/api/v9/guilds/203039963636301824",
            "/api/gateway",
            "/api/v10/users/@me",
        ] {
            let bucket = optimistic_bucket_path(url, "GET");
            assert!(bucket.starts_with('/'));
            assert!(!bucket.starts_with("/api/"));
        }
    }
}
