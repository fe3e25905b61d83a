//! String helpers for logging and for bounding payload sizes.

/// Largest prefix of `s` that is at most `max` bytes and ends on a char boundary.
fn prefix_on_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes with an ellipsis and a count of
/// the dropped bytes appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    let head = prefix_on_boundary(s, max);
    if head.len() == s.len() {
        s.to_string()
    } else {
        format!("{}…(+{} bytes)", head, s.len() - head.len())
    }
}

/// Bound a fetched body to `max_bytes` so raw events stay small.
pub fn bounded_snippet(body: &str, max_bytes: usize) -> String {
    prefix_on_boundary(body, max_bytes).to_string()
}
