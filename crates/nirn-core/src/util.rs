//! Hashing and token utilities shared across the proxy.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use crc::{Crc, CRC_64_GO_ISO};

/// Discord's snowflake epoch, milliseconds since the unix epoch.
pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// CRC-64 (ISO polynomial) of the input. Bucket keys, tokens and bot ids
/// all hash through this so every node derives identical routing hashes.
pub fn hash_crc64(data: &str) -> u64 {
    CRC64.checksum(data.as_bytes())
}

/// Creation time embedded in a snowflake id.
pub fn snowflake_created_at(snowflake: &str) -> Option<SystemTime> {
    let id: u64 = snowflake.parse().ok()?;
    let epoch_ms = (id >> 22) + DISCORD_EPOCH_MS;
    Some(UNIX_EPOCH + Duration::from_millis(epoch_ms))
}

/// Best-effort client id extracted from an `Authorization` header value.
///
/// Bot tokens embed the base64-encoded user id as their first segment.
/// Used for the metrics `clientId` label, never for auth decisions.
pub fn client_id_from_token(token: &str) -> String {
    if token.is_empty() {
        return "NoAuth".to_string();
    }
    let stripped = token
        .trim_start_matches("Bot ")
        .trim_start_matches("Bearer ");
    let first = stripped.split('.').next().unwrap_or_default();
    let engine = base64::engine::general_purpose::STANDARD_NO_PAD;
    match engine.decode(first.trim_end_matches('=')) {
        Ok(raw) => match String::from_utf8(raw) {
            Ok(id) => id,
            Err(_) => "Unknown".to_string(),
        },
        Err(_) => "Unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Calculated using the ISO table
    const KNOWN_HASH: u64 = 10232006911339297906;

    #[test]
    fn hash_matches_known_vector() {
        assert_eq!(hash_crc64("test data"), KNOWN_HASH);
    }

    #[test]
    fn hash_is_consistent_across_runs() {
        for i in 0..50_000 {
            hash_crc64(&i.to_string());
        }
        assert_eq!(hash_crc64("test data"), KNOWN_HASH);
    }

    #[test]
    fn snowflake_timestamp_extraction() {
        // 2015-10-03, well before any 14d window
        let created = snowflake_created_at("203039963636301824").expect("valid snowflake");
        let ms = created
            .duration_since(UNIX_EPOCH)
            .expect("after epoch")
            .as_millis() as u64;
        assert_eq!(ms, (203039963636301824u64 >> 22) + DISCORD_EPOCH_MS);
    }

    #[test]
    fn snowflake_rejects_non_numeric() {
        assert!(snowflake_created_at("not-a-snowflake").is_none());
    }

    #[test]
    fn client_id_decodes_bot_token() {
        // base64("203039963636301824") == "MjAzMDM5OTYzNjM2MzAxODI0"
        let token = "Bot MjAzMDM5OTYzNjM2MzAxODI0.XXXXXX.YYYYYY";
        assert_eq!(client_id_from_token(token), "203039963636301824");
    }

    #[test]
    fn client_id_handles_empty_and_garbage() {
        assert_eq!(client_id_from_token(""), "NoAuth");
        assert_eq!(client_id_from_token("Bot !!!!.a.b"), "Unknown");
    }
}
