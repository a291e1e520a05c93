// src/normalize.rs

use regex::Regex;

/// Pull a number out of a free-form recognized field.
///
/// Handwritten sheets come back from the recognizer with units and currency
/// marks attached ("85元", "约12.5斤"). We take the first maximal run of
/// digits and dots and try to parse it. Anything after that run is ignored,
/// including a second number in the same field, so a range like "10-12"
/// yields 10. Known ambiguity, kept on purpose.
pub fn normalize(value: Option<&str>) -> Option<f64> {
    let text = value?.trim();
    if text.is_empty() {
        return None;
    }

    let re = Regex::new(r"[0-9.]+").ok()?;
    let run = re.find(text)?.as_str();

    // A run with stray dots ("12.5.3") fails the parse and stays missing.
    // We do not back off to a shorter numeric prefix.
    run.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_integer() {
        assert_eq!(normalize(Some("85")), Some(85.0));
    }

    #[test]
    fn test_currency_suffix() {
        assert_eq!(normalize(Some("85元")), Some(85.0));
    }

    #[test]
    fn test_unit_with_prefix_noise() {
        assert_eq!(normalize(Some("约12.5斤")), Some(12.5));
    }

    #[test]
    fn test_empty_and_absent() {
        assert_eq!(normalize(Some("")), None);
        assert_eq!(normalize(Some("   ")), None);
        assert_eq!(normalize(None), None);
    }

    #[test]
    fn test_no_digits() {
        assert_eq!(normalize(Some("未知")), None);
        assert_eq!(normalize(Some("n/a")), None);
    }

    #[test]
    fn test_malformed_decimal_is_missing() {
        // The whole run "12.5.3" is taken and fails to parse. Pinned: no
        // fallback to the "12.5" prefix.
        assert_eq!(normalize(Some("12.5.3")), None);
        assert_eq!(normalize(Some(".")), None);
    }

    #[test]
    fn test_first_run_wins() {
        // Price range: the first number is taken, the second discarded.
        assert_eq!(normalize(Some("10-12")), Some(10.0));
        assert_eq!(normalize(Some("3斤 另加2斤")), Some(3.0));
    }

    #[test]
    fn test_embedded_whitespace() {
        assert_eq!(normalize(Some("  42.50 元 ")), Some(42.5));
    }
}
