//! Slug derivation for storage-key segments.
//!
//! All helpers are deterministic pure functions: the same input always yields
//! the same slug, which is what makes storage keys collide predictably.

/// Structural tokens treated as separators before slugging. Scheme and
/// host noise (`https`, `http`, `www`) is stripped so that URL fragments
/// passed in whole still produce endpoint-shaped slugs.
const STRUCTURAL_TOKENS: [&str; 3] = ["https", "http", "www"];
const SEPARATOR_CHARS: [char; 5] = ['.', '/', '?', '=', '&'];

/// Lowercases and inserts hyphens at case boundaries (`userId` → `user-id`).
pub fn kebab(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_lower = false;
    for ch in value.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}

/// Produces a filesystem/identifier-safe slug: kebab-cased, structural tokens
/// and separators turned into hyphens, non-alphanumeric runs collapsed,
/// leading/trailing hyphens trimmed.
pub fn slug(value: &str) -> String {
    let mut replaced = kebab(value);
    for token in STRUCTURAL_TOKENS {
        replaced = replaced.replace(token, "-");
    }
    let replaced: String = replaced
        .chars()
        .map(|ch| if SEPARATOR_CHARS.contains(&ch) { '-' } else { ch })
        .collect();

    let mut out = String::with_capacity(replaced.len());
    let mut pending_hyphen = false;
    for ch in replaced.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Derives the "service" key segment from a request host: the label
/// immediately preceding the public suffix, kebab-cased (`api.example.com` →
/// `example`). Single-label hosts are used as-is.
pub fn service_slug(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').filter(|label| !label.is_empty()).collect();
    let service = match labels.len() {
        0 => host,
        1 => labels[0],
        len => labels[len - 2],
    };
    slug(service)
}
