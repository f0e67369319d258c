//! String utilities for safe text handling

/// Creates a safe UTF-8 preview of a string, respecting character boundaries.
///
/// Unlike byte slicing (`&s[..n]`), this function will never panic on
/// multi-byte UTF-8 characters (Cyrillic, emoji).
pub fn safe_preview(text: &str, max_chars: usize) -> String {
    let preview: String = text.chars().take(max_chars).collect();
    if text.chars().nth(max_chars).is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Truncates to at most `max_chars` characters without an ellipsis.
/// Returns the original string if it fits.
pub fn truncate_safe(text: &str, max_chars: usize) -> &str {
    if text.chars().count() <= max_chars {
        text
    } else {
        let byte_idx = text
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(text.len());
        &text[..byte_idx]
    }
}

/// Lowercases and keeps only alphanumeric characters and single spaces.
/// Used for fuzzy matching of tool-card titles.
pub fn norm_for_match(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for ch in s.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Keeps only ASCII digits. Used to compare date/time strings irrespective of
/// their formatting.
pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Builds a stable tool id of the form `t_<slug>` from a type/name pair.
pub fn tool_slug(kind: &str, name: &str) -> String {
    let key = format!("{}_{}", kind, name).to_lowercase();
    let mut slug = String::with_capacity(key.len());
    let mut last_sep = true;
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_sep = false;
        } else if !last_sep {
            slug.push('_');
            last_sep = true;
        }
    }
    let slug = slug.trim_matches('_');
    format!("t_{}", slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_preview_ascii() {
        assert_eq!(safe_preview("hello world", 5), "hello...");
        assert_eq!(safe_preview("hi", 5), "hi");
    }

    #[test]
    fn safe_preview_cyrillic_does_not_panic() {
        let text = "Здравствуйте, мир";
        let preview = safe_preview(text, 5);
        assert!(preview.starts_with("Здрав"));
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn truncate_safe_respects_char_boundaries() {
        assert_eq!(truncate_safe("hello", 10), "hello");
        assert_eq!(truncate_safe("привет мир", 6), "привет");
    }

    #[test]
    fn norm_for_match_collapses_punctuation() {
        assert_eq!(norm_for_match("Встреча: 14:00, офис!"), "встреча 14 00 офис");
        assert_eq!(norm_for_match("  A--B  "), "a b");
    }

    #[test]
    fn digits_only_strips_everything_else() {
        assert_eq!(digits_only("12.05.2025 14:30"), "120520251430");
        assert_eq!(digits_only("no digits"), "");
    }

    #[test]
    fn tool_slug_is_stable() {
        assert_eq!(tool_slug("calendar", "Calendar Create"), "t_calendar_calendar_create");
        assert_eq!(tool_slug("", "gmail"), "t_gmail");
    }
}
