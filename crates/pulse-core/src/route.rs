/// Collapse dynamic path segments into a stable route template.
///
/// Segments that are fully numeric, or that are 12+ hex characters, become
/// the literal `:id` token, so `/user/482` and `/user/917` aggregate under
/// `/user/:id`. The query string is stripped, a leading `/` is guaranteed,
/// and a single trailing slash is removed unless the result is the root.
/// Idempotent: normalizing an already-normalized route is a no-op.
pub fn normalize_route(raw: Option<&str>) -> String {
    let raw = match raw {
        Some(s) if !s.trim().is_empty() => s,
        _ => return "/".to_string(),
    };
    let path = raw.split('?').next().unwrap_or("");
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    let segments: Vec<String> = path
        .split('/')
        .map(|seg| {
            if is_dynamic_segment(seg) {
                ":id".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect();
    let mut joined = segments.join("/");

    if joined.len() > 1 && joined.ends_with('/') {
        joined.truncate(joined.trim_end_matches('/').len());
    }
    if joined.is_empty() {
        joined.push('/');
    }
    joined
}

fn is_dynamic_segment(seg: &str) -> bool {
    if seg.is_empty() {
        return false;
    }
    let numeric = seg.bytes().all(|b| b.is_ascii_digit());
    let long_hex = seg.len() >= 12 && seg.bytes().all(|b| b.is_ascii_hexdigit());
    numeric || long_hex
}
