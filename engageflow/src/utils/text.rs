//! String helpers.

/// Truncates `input` to at most `max_chars` characters, appending an ellipsis
/// when anything was cut. Operates on chars so multi-byte text never splits.
#[must_use]
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = input.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_strings_untouched() {
        assert_eq!(truncate_chars("timeout", 280), "timeout");
    }

    #[test]
    fn test_long_strings_truncated() {
        let long = "x".repeat(500);
        let out = truncate_chars(&long, 280);
        assert_eq!(out.chars().count(), 280);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_multibyte_safe() {
        let out = truncate_chars("héllo wörld ünïcode", 8);
        assert_eq!(out, "héllo...");
    }
}
