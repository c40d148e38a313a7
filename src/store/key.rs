//! URL canonicalization and key derivation.
//!
//! The dedup primary key is a sha256 digest of the lower-cased, cleaned
//! URL. Canonicalization is intentionally conservative: it must never map
//! two genuinely different articles to one key, so only noise that cannot
//! change the target page is stripped.

use sha2::{Digest, Sha256};

/// Canonicalize a raw URL string for keying.
///
/// Lower-cases, trims surrounding whitespace, drops the fragment, and
/// removes a single trailing slash from the path. Malformed input is
/// canonicalized on a best-effort basis; key derivation never fails.
pub fn canonicalize(raw: &str) -> String {
    let mut url = raw.trim().to_lowercase();

    if let Some(pos) = url.find('#') {
        url.truncate(pos);
    }

    // Trailing slash only when there is a path beyond the scheme+host.
    if url.ends_with('/') {
        let without_scheme = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(url.as_str());
        if without_scheme.trim_end_matches('/').contains('/') {
            url.truncate(url.len() - 1);
        }
    }

    url
}

/// Derive the dedup primary key for a URL.
pub fn url_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(raw).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_lowercases_and_trims() {
        assert_eq!(
            canonicalize("  https://Golf.example/News/Article "),
            "https://golf.example/news/article"
        );
    }

    #[test]
    fn test_canonicalize_strips_fragment() {
        assert_eq!(
            canonicalize("https://golf.example/a#section-2"),
            "https://golf.example/a"
        );
    }

    #[test]
    fn test_canonicalize_trailing_slash() {
        assert_eq!(
            canonicalize("https://golf.example/news/article/"),
            "https://golf.example/news/article"
        );
        // Bare host keeps its slash: stripping it is not meaningful.
        assert_eq!(canonicalize("https://golf.example/"), "https://golf.example/");
    }

    #[test]
    fn test_url_key_equivalent_forms_collide() {
        let a = url_key("https://golf.example/Article/");
        let b = url_key("HTTPS://GOLF.EXAMPLE/article#top");
        assert_eq!(a, b);
    }

    #[test]
    fn test_url_key_distinct_urls_differ() {
        assert_ne!(
            url_key("https://golf.example/a"),
            url_key("https://golf.example/b")
        );
    }

    #[test]
    fn test_url_key_is_hex_sha256() {
        let key = url_key("https://golf.example/a");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_malformed_input_still_keys() {
        let key = url_key("not a url at all");
        assert_eq!(key.len(), 64);
    }
}
