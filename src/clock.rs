//! Wall-clock helpers and opaque identifiers

use uuid::Uuid;

/// Current UTC time as whole seconds since the epoch
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fresh opaque id for a round record
pub fn new_round_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ts_is_recent() {
        // Any date after 2024 and before 2100
        let ts = now_ts();
        assert!(ts > 1_700_000_000);
        assert!(ts < 4_100_000_000);
    }

    #[test]
    fn test_round_ids_are_unique() {
        let a = new_round_id();
        let b = new_round_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
