//! Pure text helpers shared by the delivery paths.

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
pub fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Keep at most `max` characters, appending "..." when anything was cut.
pub fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Short, char-safe preview for log lines.
pub fn preview(text: &str, max_bytes: usize) -> &str {
    &text[..floor_char_boundary(text, max_bytes)]
}

/// Apply a silence marker to a trimmed reply.
///
/// Returns `None` when the reply contains the marker or is empty once the
/// marker is removed. Without a marker only emptiness silences.
pub fn unless_silent(reply: &str, marker: Option<&str>) -> Option<String> {
    let reply = reply.trim();
    let marker = marker.filter(|m| !m.is_empty());
    if let Some(marker) = marker {
        if reply.contains(marker) {
            return None;
        }
    }
    let cleaned = match marker {
        Some(marker) => reply.replace(marker, "").trim().to_string(),
        None => reply.to_string(),
    };
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Split a message into chunks of at most `max_len` bytes, preferring newlines.
pub fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len || max_len == 0 {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining);
            break;
        }

        let limit = floor_char_boundary(remaining, max_len);
        let split_at = remaining[..limit]
            .rfind('\n')
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        // A single char wider than max_len still has to go somewhere.
        let split_at = if split_at == 0 {
            remaining.chars().next().map_or(remaining.len(), char::len_utf8)
        } else {
            split_at
        };

        chunks.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
        assert_eq!(truncate_with_ellipsis("hello!", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("привет мир", 6), "привет...");
        assert_eq!(truncate_with_ellipsis("", 3), "");
    }

    #[test]
    fn marker_anywhere_silences() {
        assert_eq!(unless_silent("all quiet HEARTBEAT_OK", Some("HEARTBEAT_OK")), None);
        assert_eq!(unless_silent("HEARTBEAT_OK", Some("HEARTBEAT_OK")), None);
    }

    #[test]
    fn reply_without_marker_is_trimmed() {
        assert_eq!(
            unless_silent("  two tasks are late \n", Some("HEARTBEAT_OK")),
            Some("two tasks are late".to_string())
        );
        assert_eq!(unless_silent("  body  ", None), Some("body".to_string()));
    }

    #[test]
    fn blank_reply_is_silent() {
        assert_eq!(unless_silent("   \n", None), None);
        assert_eq!(unless_silent("", Some("X")), None);
    }

    #[test]
    fn empty_marker_is_ignored() {
        assert_eq!(unless_silent("text", Some("")), Some("text".to_string()));
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("hello", 4000), vec!["hello"]);
    }

    #[test]
    fn split_message_at_newline() {
        let line = "a".repeat(2000);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_message(&text, 4001);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('\n'));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let text = "ж".repeat(10);
        let chunks = split_message(&text, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn preview_never_splits_a_char() {
        assert_eq!(preview("жжж", 3), "ж");
        assert_eq!(preview("abc", 10), "abc");
    }
}
