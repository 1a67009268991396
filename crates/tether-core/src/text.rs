//! Text helpers for log previews and diagnostic strings.

/// Longest diagnostic body kept after sanitizing.
pub const MAX_DIAGNOSTIC_LEN: usize = 240;

/// Truncate `s` to at most `max_bytes`, backing off to a UTF-8 boundary.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Turn an arbitrary error body (HTTP response, stderr) into a one-line
/// diagnostic.
///
/// Control characters become spaces, whitespace runs collapse, and the
/// result is capped at [`MAX_DIAGNOSTIC_LEN`] bytes with a `...` suffix.
pub fn sanitize_diagnostic(body: &str) -> String {
    let flattened: String = body
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect();
    let collapsed = flattened.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() > MAX_DIAGNOSTIC_LEN {
        format!("{}...", truncate_str(&collapsed, MAX_DIAGNOSTIC_LEN))
    } else {
        collapsed
    }
}
