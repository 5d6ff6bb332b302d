//! Key builder: the `{base}[:stub][:sub]` cluster hash-tag convention.

pub const LOG_STUB: &str = "[*-LOG-*]";
pub const STATUS_STUB: &str = "[*-STATUS-*]";
pub const STREAM_STUB: &str = "[*-STREAM-*]";
pub const STOP_STUB: &str = "[*-STOP-*]";
pub const CHANNEL_STUB: &str = "<$-CHANNEL-$>";

const AMBIGUOUS_HASH_TAG_CHARS: [char; 4] = ['*', '?', '[', ']'];

/// Builds and splits the schema-convention keys for one adapter instance.
///
/// `base` is the adapter's home base key, used whenever a caller does not
/// supply an override.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    base: String,
}

impl KeyBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        KeyBuilder { base: base.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `true` if `base` contains a character that would make a hash-tag
    /// pattern subscription ambiguous.
    pub fn has_ambiguous_chars(base: &str) -> bool {
        base.contains(AMBIGUOUS_HASH_TAG_CHARS.as_slice())
    }

    /// Compose `{base}[:sub]`, overriding the home base when `base_override`
    /// is given.
    pub fn build(&self, sub: &str, base_override: Option<&str>) -> String {
        let base = base_override.unwrap_or(&self.base);
        if sub.is_empty() {
            format!("{{{base}}}")
        } else {
            format!("{{{base}}}:{sub}")
        }
    }

    pub fn build_default(&self, sub: &str) -> String {
        self.build(sub, None)
    }

    /// Inverse of [`KeyBuilder::build`] against the home base: returns
    /// `(base, sub)` when `key` begins with an exact `{base}` hash tag,
    /// otherwise `(String::new(), String::new())`.
    ///
    /// This is an exact prefix match, not a substring search: a key whose
    /// sub-key happens to contain the base key as text must not be
    /// misidentified as belonging to that base.
    pub fn split(&self, key: &str) -> (String, String) {
        let prefix = format!("{{{}}}", self.base);
        if let Some(rest) = key.strip_prefix(&prefix) {
            let sub = rest.strip_prefix(':').unwrap_or(rest);
            (self.base.clone(), sub.to_string())
        } else {
            (String::new(), String::new())
        }
    }

    /// `true` when `key` is recognised as belonging to this adapter's home
    /// base (used to reject schema keys from the generic reader).
    pub fn is_schema_key(&self, key: &str) -> bool {
        !self.split(key).0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_split_round_trips() {
        let kb = KeyBuilder::new("BASE");
        let key = kb.build_default("temp");
        assert_eq!(key, "{BASE}:temp");
        assert_eq!(kb.split(&key), ("BASE".to_string(), "temp".to_string()));
    }

    #[test]
    fn build_without_sub_has_no_trailing_colon() {
        let kb = KeyBuilder::new("BASE");
        assert_eq!(kb.build_default(""), "{BASE}");
        assert_eq!(kb.split("{BASE}"), ("BASE".to_string(), String::new()));
    }

    #[test]
    fn split_rejects_substring_match_that_is_not_an_exact_prefix() {
        let kb = KeyBuilder::new("BASE");
        // "NOTBASE" contains "BASE" as a substring but is not the `{BASE}` tag.
        assert_eq!(kb.split("{NOTBASE}:temp"), (String::new(), String::new()));
        // A key whose sub-key text happens to contain the base string.
        assert_eq!(
            kb.split("{OTHER}:contains-BASE-in-text"),
            (String::new(), String::new())
        );
    }

    #[test]
    fn log_and_status_stubs_build_distinct_keys_from_the_same_sub() {
        let kb = KeyBuilder::new("BASE");
        let log_key = kb.build_default(&format!("{LOG_STUB}:temp"));
        let status_key = kb.build_default(&format!("{STATUS_STUB}:temp"));
        let stream_key = kb.build_default(&format!("{STREAM_STUB}:temp"));
        assert_ne!(log_key, status_key);
        assert_ne!(log_key, stream_key);
        assert_ne!(status_key, stream_key);
        // Same base, so all three still share a hash tag (one cluster slot).
        assert_eq!(log_key.split(':').next(), status_key.split(':').next());
    }

    #[test]
    fn same_base_different_sub_share_the_hash_tag() {
        let kb = KeyBuilder::new("BASE");
        let a = kb.build_default("a");
        let b = kb.build_default("b");
        // Same literal hash tag text => same cluster slot under any real hasher.
        assert_eq!(
            a.split(':').next().unwrap(),
            b.split(':').next().unwrap()
        );
    }

    #[test]
    fn ambiguous_base_rejects_pattern_subscription() {
        assert!(KeyBuilder::has_ambiguous_chars("BASE*"));
        assert!(!KeyBuilder::has_ambiguous_chars("BASE"));
    }

    proptest::proptest! {
        #[test]
        fn key_round_trip_holds_for_bases_without_braces_or_colons(
            base in "[a-zA-Z0-9_]{1,16}",
            sub in "[a-zA-Z0-9_]{0,16}",
        ) {
            let kb = KeyBuilder::new(base.clone());
            let key = kb.build_default(&sub);
            proptest::prop_assert_eq!(kb.split(&key), (base, sub));
        }
    }
}
