//! `@handle` mention extraction from message text

use once_cell::sync::Lazy;
use regex::Regex;

/// Handles follow the slug alphabet produced by `slugify_handle`, plus
/// hyphens for hand-chosen handles.
static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([\p{Alphabetic}0-9][\p{Alphabetic}0-9_-]*)").expect("valid regex"));

/// Extract mentioned handles from `text`, in order of first appearance,
/// deduplicated.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for capture in MENTION_RE.captures_iter(text) {
        let handle = capture[1].to_string();
        if !seen.contains(&handle) {
            seen.push(handle);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_in_order() {
        assert_eq!(
            extract_mentions("hey @bob and @alice, ping @bob again"),
            vec!["bob".to_string(), "alice".to_string()]
        );
    }

    #[test]
    fn test_no_mentions() {
        assert!(extract_mentions("plain text, email-ish foo@ nothing").is_empty());
    }

    #[test]
    fn test_punctuation_boundary() {
        assert_eq!(extract_mentions("thanks @maid!"), vec!["maid".to_string()]);
        assert_eq!(
            extract_mentions("(@dr_who?)"),
            vec!["dr_who".to_string()]
        );
    }
}
