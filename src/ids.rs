// src/ids.rs
// Time-ordered 128-bit identifiers (spec §4.1: "identifiers via a time-ordered
// 128-bit scheme so that natural ordering matches creation order"). UUIDv7
// embeds a millisecond timestamp in the high bits, giving lexicographic
// ordering of the hyphenated string form that matches creation order.

use uuid::Uuid;

/// Generate a new time-ordered identifier.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Validate an identifier used to build a SQL identifier list or column
/// name (table names, not row ids). Only ASCII alphanumerics and
/// underscores are accepted; this guards the dynamic SQL built during
/// schema migration probes (spec §4.1).
pub fn is_safe_sql_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_time_ordered() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(a < b);
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(is_safe_sql_identifier("messages"));
        assert!(is_safe_sql_identifier("archive_iterations"));
        assert!(!is_safe_sql_identifier(""));
        assert!(!is_safe_sql_identifier("messages; DROP TABLE x"));
        assert!(!is_safe_sql_identifier("1messages"));
    }
}
