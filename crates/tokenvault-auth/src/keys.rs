//! Storage key layout.
//!
//! Every key the core writes is built here so the layout is stable across
//! providers and process versions.

use time::OffsetDateTime;

use crate::types::TokenKind;

/// `session:{id}`
pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// `user_sessions:{user_id}` (set of session ids)
pub fn user_sessions(user_id: &str) -> String {
    format!("user_sessions:{user_id}")
}

/// `rotation:{session_id}`
pub fn rotation(session_id: &str) -> String {
    format!("rotation:{session_id}")
}

/// `lock:rotation:{session_id}`
pub fn rotation_lock(session_id: &str) -> String {
    format!("lock:rotation:{session_id}")
}

/// `token:{kind}:{hash}`
pub fn token_metadata(kind: TokenKind, token_hash: &str) -> String {
    format!("token:{}:{token_hash}", kind.as_str())
}

/// `revoked:{hash}`
pub fn revoked(token_hash: &str) -> String {
    format!("revoked:{token_hash}")
}

/// `rate_limit:{operation}:{identifier}`
pub fn rate_limit(operation: &str, identifier: &str) -> String {
    format!("rate_limit:{operation}:{identifier}")
}

/// `rate_limit:backoff:{operation}:{identifier}`
pub fn rate_limit_backoff(operation: &str, identifier: &str) -> String {
    format!("rate_limit:backoff:{operation}:{identifier}")
}

/// `rate_limit:failures:{operation}:{identifier}`
pub fn rate_limit_failures(operation: &str, identifier: &str) -> String {
    format!("rate_limit:failures:{operation}:{identifier}")
}

/// `rate_limit:global:{unix_second}`
pub fn rate_limit_global(unix_second: i64) -> String {
    format!("rate_limit:global:{unix_second}")
}

/// `audit:event:{id}`
pub fn audit_event(event_id: &str) -> String {
    format!("audit:event:{event_id}")
}

/// `audit:user:{user_id}:{ts}:{event_id}`
pub fn audit_user(user_id: &str, at: OffsetDateTime, event_id: &str) -> String {
    format!("audit:user:{user_id}:{}:{event_id}", sortable_ts(at))
}

/// `audit:session:{session_id}:{ts}:{event_id}`
pub fn audit_session(session_id: &str, at: OffsetDateTime, event_id: &str) -> String {
    format!("audit:session:{session_id}:{}:{event_id}", sortable_ts(at))
}

/// `audit:date:{yyyymmdd}:{ts}:{event_id}`
pub fn audit_date(at: OffsetDateTime, event_id: &str) -> String {
    format!("audit:date:{}:{}:{event_id}", day_stamp(at), sortable_ts(at))
}

/// Calendar day of `at` in UTC as `yyyymmdd`.
pub fn day_stamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day()
    )
}

/// Zero-padded unix milliseconds so lexical order equals time order.
fn sortable_ts(at: OffsetDateTime) -> String {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    format!("{millis:015}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_plain_keys() {
        assert_eq!(session("s1"), "session:s1");
        assert_eq!(user_sessions("u1"), "user_sessions:u1");
        assert_eq!(rotation("s1"), "rotation:s1");
        assert_eq!(revoked("abc"), "revoked:abc");
        assert_eq!(token_metadata(TokenKind::Refresh, "abc"), "token:refresh:abc");
        assert_eq!(rate_limit("token_refresh", "s1"), "rate_limit:token_refresh:s1");
        assert_eq!(
            rate_limit_backoff("token_refresh", "s1"),
            "rate_limit:backoff:token_refresh:s1"
        );
    }

    #[test]
    fn test_day_stamp() {
        assert_eq!(day_stamp(datetime!(2024-03-07 23:59:59 UTC)), "20240307");
        // Offsets are normalised to UTC.
        assert_eq!(day_stamp(datetime!(2024-03-07 23:30:00 -02:00)), "20240308");
    }

    #[test]
    fn test_audit_keys_sort_by_time() {
        let earlier = audit_user("u1", datetime!(2024-01-01 00:00:00 UTC), "b");
        let later = audit_user("u1", datetime!(2024-01-02 00:00:00 UTC), "a");
        assert!(earlier < later);
        assert!(audit_date(datetime!(2024-01-02 00:00:00 UTC), "x").starts_with("audit:date:20240102:"));
    }
}
