use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sum of replica counts, clamped at `u32::MAX`.
pub fn saturating_total<'a>(counts: impl IntoIterator<Item = &'a u32>) -> u32 {
    counts.into_iter().fold(0u32, |acc, n| acc.saturating_add(*n))
}

/// Trailing decimal digits of a pool name ("ng-2" -> 2). Used as a
/// deterministic tie-break; names without a numeric suffix sort last.
pub fn numeric_suffix(name: &str) -> Option<u64> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_is_parsed_from_trailing_digits() {
        assert_eq!(numeric_suffix("ng-2"), Some(2));
        assert_eq!(numeric_suffix("ng-standard-10"), Some(10));
        assert_eq!(numeric_suffix("ng-2xlarge"), None);
        assert_eq!(numeric_suffix(""), None);
    }

    #[test]
    fn totals_clamp_instead_of_wrapping() {
        assert_eq!(saturating_total(&[2, 3]), 5);
        assert_eq!(saturating_total(&[u32::MAX, 1, 7]), u32::MAX);
        assert_eq!(saturating_total(&[]), 0);
    }
}
