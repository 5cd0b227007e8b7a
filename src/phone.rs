//! Phone number normalization.
//!
//! Every store key and transport recipient uses the normalized form so that
//! "+1 (555) 123-4567", "555.123.4567" and "15551234567" all resolve to the
//! same conversation record.

/// Normalize a phone number to `+<digits>` form.
///
/// Ten-digit numbers get a US country code; numbers that already carry one
/// keep it. Returns `None` when fewer than 10 digits remain after stripping.
pub fn normalize(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    match digits.len() {
        0..=9 => None,
        10 => Some(format!("+1{digits}")),
        11 if digits.starts_with('1') => Some(format!("+{digits}")),
        _ => Some(format!("+{digits}")),
    }
}

/// Whether a string looks like a phone number at all (used when splitting
/// member entries like "John 555-123-4567").
pub fn looks_like_phone(raw: &str) -> bool {
    raw.chars().filter(|c| c.is_ascii_digit()).count() >= 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_formatted_us_number() {
        assert_eq!(
            normalize("+1 (555) 123-4567").as_deref(),
            Some("+15551234567")
        );
        assert_eq!(normalize("555.123.4567").as_deref(), Some("+15551234567"));
        assert_eq!(normalize("15551234567").as_deref(), Some("+15551234567"));
    }

    #[test]
    fn keeps_international_prefix() {
        assert_eq!(normalize("+447911123456").as_deref(), Some("+447911123456"));
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(normalize("12345"), None);
        assert_eq!(normalize("yes"), None);
    }

    #[test]
    fn same_key_for_equivalent_forms() {
        let a = normalize("(555) 123-4567").unwrap();
        let b = normalize("1-555-123-4567").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn detects_phone_in_text() {
        assert!(looks_like_phone("John 555-123-4567"));
        assert!(!looks_like_phone("John on Friday"));
    }
}
