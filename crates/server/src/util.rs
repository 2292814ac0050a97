use chrono::Utc;

const MAX_FILENAME_LEN: usize = 64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Reduces a client-supplied filename to a safe subset: `[A-Za-z0-9._-]`,
/// no leading dots, bounded length.
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    while sanitized.starts_with('.') || sanitized.starts_with('_') {
        sanitized.remove(0);
    }
    sanitized.truncate(MAX_FILENAME_LEN);
    if sanitized.is_empty() {
        sanitized.push_str("file");
    }
    sanitized
}
