//! Content fingerprints used as the dedup and idempotency key.
//!
//! The fingerprint is SHA-256 over the URL, the title and the publish time
//! rendered as an RFC 3339 UTC timestamp, hex encoded. The body is not part of
//! it, so two fetches of the same article with different bodies collapse onto
//! one canonical row.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Timestamp rendered in place of an absent publish time.
pub const ABSENT_PUBLISH_TIME: &str = "0001-01-01T00:00:00Z";

/// Render `publish_time` the way it is fed into the fingerprint.
pub fn canonical_timestamp(publish_time: Option<DateTime<Utc>>) -> String {
    match publish_time {
        Some(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => ABSENT_PUBLISH_TIME.to_string(),
    }
}

/// Compute the 64-character hex fingerprint of an article.
pub fn fingerprint(url: &str, title: &str, publish_time: Option<DateTime<Utc>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(canonical_timestamp(publish_time).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_same_input_same_hash() {
        let t = Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap();
        assert_eq!(
            fingerprint("https://a.example/1", "Title", Some(t)),
            fingerprint("https://a.example/1", "Title", Some(t))
        );
    }

    #[test]
    fn test_hash_format() {
        let hash = fingerprint("https://a.example/1", "Title", None);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_each_field_changes_hash() {
        let t = Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap();
        let base = fingerprint("https://a.example/1", "Title", Some(t));
        assert_ne!(base, fingerprint("https://a.example/2", "Title", Some(t)));
        assert_ne!(base, fingerprint("https://a.example/1", "Other", Some(t)));
        assert_ne!(base, fingerprint("https://a.example/1", "Title", None));
    }

    #[test]
    fn test_offset_does_not_change_hash() {
        let beijing = FixedOffset::east_opt(8 * 3600).unwrap();
        let local = beijing.with_ymd_and_hms(2024, 5, 6, 16, 0, 0).unwrap();
        let utc = Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap();
        assert_eq!(
            fingerprint("u", "t", Some(local.with_timezone(&Utc))),
            fingerprint("u", "t", Some(utc))
        );
    }

    #[test]
    fn test_canonical_timestamp() {
        let t = Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap();
        assert_eq!(canonical_timestamp(Some(t)), "2024-05-06T08:00:00Z");
        assert_eq!(canonical_timestamp(None), ABSENT_PUBLISH_TIME);
    }

    #[test]
    fn test_sub_second_precision_is_dropped() {
        let t = Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap();
        let later = t + chrono::Duration::milliseconds(250);
        assert_eq!(fingerprint("u", "t", Some(t)), fingerprint("u", "t", Some(later)));
    }
}
