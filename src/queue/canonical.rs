//! URL canonicalization and fingerprinting
//!
//! Dedup keys are computed from the canonical form, not the raw string,
//! so `HTTP://Example.com:80/a?b=2&a=1#x` and `http://example.com/a?a=1&b=2`
//! collapse to one queue row. The fingerprint is a SHA-256 over the
//! canonical form, hex encoded.

use sha2::{Digest, Sha256};
use url::Url;

use super::QueueError;

/// Canonicalize a URL for dedup purposes.
///
/// Rules: lower-case scheme and host (the parser already does both),
/// strip default ports, drop the fragment, sort query pairs
/// lexicographically by key then value, keep path case, drop the
/// trailing slash on non-root paths. Idempotent:
/// `canonicalize(canonicalize(u)) == canonicalize(u)`.
pub fn canonicalize(raw: &str) -> Result<String, QueueError> {
    let parsed = Url::parse(raw).map_err(|e| QueueError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if parsed.host_str().is_none() {
        return Err(QueueError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL has no host".to_string(),
        });
    }

    let mut canonical = String::with_capacity(raw.len());
    canonical.push_str(parsed.scheme());
    canonical.push_str("://");
    if let Some(host) = parsed.host_str() {
        canonical.push_str(host);
    }

    // `Url::port` is already None for scheme-default ports
    if let Some(port) = parsed.port() {
        canonical.push(':');
        canonical.push_str(&port.to_string());
    }

    let path = parsed.path();
    if path.len() > 1 && path.ends_with('/') {
        canonical.push_str(&path[..path.len() - 1]);
    } else {
        canonical.push_str(path);
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        canonical.push('?');
        for (i, (k, v)) in pairs.iter().enumerate() {
            if i > 0 {
                canonical.push('&');
            }
            canonical.push_str(&urlencode_component(k));
            if !v.is_empty() {
                canonical.push('=');
                canonical.push_str(&urlencode_component(v));
            }
        }
    }

    // Fragment dropped

    Ok(canonical)
}

/// Minimal percent-encoding for query components; keeps the canonical
/// form stable across decode/encode cycles.
fn urlencode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// 256-bit stable fingerprint of the canonical URL, hex encoded
#[must_use]
pub fn url_fingerprint(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(
            canonicalize("HTTPS://Example.COM/Keep/Case").unwrap(),
            "https://example.com/Keep/Case"
        );
    }

    #[test]
    fn strips_default_ports() {
        assert_eq!(
            canonicalize("http://example.com:80/a").unwrap(),
            "http://example.com/a"
        );
        assert_eq!(
            canonicalize("https://example.com:443/a").unwrap(),
            "https://example.com/a"
        );
        assert_eq!(
            canonicalize("https://example.com:8443/a").unwrap(),
            "https://example.com:8443/a"
        );
    }

    #[test]
    fn drops_fragment() {
        assert_eq!(
            canonicalize("https://example.com/a#section").unwrap(),
            "https://example.com/a"
        );
    }

    #[test]
    fn sorts_query_pairs() {
        assert_eq!(
            canonicalize("https://example.com/a?b=2&a=1&b=1").unwrap(),
            "https://example.com/a?a=1&b=1&b=2"
        );
    }

    #[test]
    fn trims_trailing_slash_on_non_root() {
        assert_eq!(
            canonicalize("https://example.com/a/").unwrap(),
            "https://example.com/a"
        );
        assert_eq!(canonicalize("https://example.com/").unwrap(), "https://example.com/");
    }

    #[test]
    fn idempotent_on_typical_urls() {
        for raw in [
            "HTTP://Example.com:80/Path/?z=9&a=1#frag",
            "https://x.dev/p/1?q=hello%20world",
            "https://x.dev:8443/",
        ] {
            let once = canonicalize(raw).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn rejects_relative_and_hostless() {
        assert!(canonicalize("/relative/path").is_err());
        assert!(canonicalize("data:text/plain,hello").is_err());
    }

    #[test]
    fn fingerprint_is_256_bit_hex() {
        let fp = url_fingerprint("https://example.com/a");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, url_fingerprint("https://example.com/a"));
        assert_ne!(fp, url_fingerprint("https://example.com/b"));
    }
}
