//! Property tests for URL canonicalization and fingerprinting

use crawlflow::queue::{canonicalize, url_fingerprint};
use proptest::prelude::*;

fn url_strategy() -> impl Strategy<Value = String> {
    let scheme = prop_oneof![Just("http"), Just("https")];
    let host = "[a-z][a-z0-9]{0,8}\\.(com|org|dev)";
    let port = prop_oneof![
        Just(String::new()),
        Just(":80".to_string()),
        Just(":443".to_string()),
        Just(":8080".to_string()),
    ];
    let path = "(/[A-Za-z0-9_-]{0,6}){0,4}/?";
    let query = proptest::collection::vec(("[a-z]{1,4}", "[a-z0-9]{0,4}"), 0..4);
    let fragment = prop_oneof![Just(String::new()), Just("#top".to_string())];

    (scheme, host, port, path, query, fragment).prop_map(
        |(scheme, host, port, path, query, fragment)| {
            let query_string = if query.is_empty() {
                String::new()
            } else {
                let pairs: Vec<String> =
                    query.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!("?{}", pairs.join("&"))
            };
            format!("{scheme}://{host}{port}{path}{query_string}{fragment}")
        },
    )
}

proptest! {
    #[test]
    fn canonicalize_is_idempotent(url in url_strategy()) {
        let once = canonicalize(&url).unwrap();
        let twice = canonicalize(&once).unwrap();
        prop_assert_eq!(&once, &twice);
    }

    #[test]
    fn canonical_form_has_no_fragment_or_default_port(url in url_strategy()) {
        let canonical = canonicalize(&url).unwrap();
        prop_assert!(!canonical.contains('#'));
        if let Some(rest) = canonical.strip_prefix("http://") {
            prop_assert!(!rest.starts_with(|c: char| c == ':'));
            prop_assert!(!rest.contains(":80/") && !rest.ends_with(":80"));
        }
        if let Some(rest) = canonical.strip_prefix("https://") {
            prop_assert!(!rest.contains(":443/") && !rest.ends_with(":443"));
        }
    }

    #[test]
    fn fingerprint_is_stable_256_bit_hex(url in url_strategy()) {
        let canonical = canonicalize(&url).unwrap();
        let fp = url_fingerprint(&canonical);
        prop_assert_eq!(fp.len(), 64);
        prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(fp, url_fingerprint(&canonical));
    }

    #[test]
    fn query_order_never_changes_identity(
        host in "[a-z]{3,8}\\.com",
        a in "[a-z]{1,3}",
        b in "[a-z]{1,3}",
    ) {
        let forward = format!("https://{host}/p?{a}=1&{b}=2");
        let backward = format!("https://{host}/p?{b}=2&{a}=1");
        prop_assert_eq!(
            canonicalize(&forward).unwrap(),
            canonicalize(&backward).unwrap()
        );
    }
}
