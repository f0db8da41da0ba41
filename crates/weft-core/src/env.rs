//! Environment lookups for weft knobs
//!
//! Every runtime knob lives in one `WEFT_` namespace and is addressed by
//! its dotted config key: `tcp.connect.timeout` reads
//! `WEFT_TCP_CONNECT_TIMEOUT`, `log.level` reads `WEFT_LOG_LEVEL`. These
//! helpers centralize that mapping and the forgiving parse — an unset
//! variable, an empty value, or a typo degrades to the caller's default
//! instead of taking the process down at startup.

use std::str::FromStr;

/// Environment variable name for a dotted config key
pub fn var_name(key: &str) -> String {
    format!("WEFT_{}", key.replace(['.', '-'], "_").to_uppercase())
}

/// Raw value of a namespaced knob, if set and non-empty
pub fn raw(key: &str) -> Option<String> {
    std::env::var(var_name(key)).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a namespaced knob, falling back to `default` when unset or
/// malformed
pub fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    raw(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean knob
///
/// `1`/`true`/`yes`/`on` enable, `0`/`false`/`no`/`off` disable (case
/// insensitive); anything else keeps the default, so an explicit "off"
/// wins even when the default is true.
pub fn flag(key: &str, default: bool) -> bool {
    let Some(value) = raw(key) else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_name_mapping() {
        assert_eq!(var_name("tcp.connect.timeout"), "WEFT_TCP_CONNECT_TIMEOUT");
        assert_eq!(var_name("log.level"), "WEFT_LOG_LEVEL");
        assert_eq!(var_name("some-dashed.key"), "WEFT_SOME_DASHED_KEY");
    }

    #[test]
    fn test_parse_or_unset_and_set() {
        let val: u64 = parse_or("test.parse.unset", 42);
        assert_eq!(val, 42);

        std::env::set_var("WEFT_TEST_PARSE_SET", " 123 ");
        let val: u64 = parse_or("test.parse.set", 0);
        assert_eq!(val, 123);
        std::env::remove_var("WEFT_TEST_PARSE_SET");
    }

    #[test]
    fn test_parse_or_malformed_falls_back() {
        std::env::set_var("WEFT_TEST_PARSE_BAD", "not_a_number");
        let val: u64 = parse_or("test.parse.bad", 99);
        assert_eq!(val, 99);
        std::env::remove_var("WEFT_TEST_PARSE_BAD");
    }

    #[test]
    fn test_raw_filters_empty() {
        std::env::set_var("WEFT_TEST_RAW_EMPTY", "   ");
        assert!(raw("test.raw.empty").is_none());
        std::env::remove_var("WEFT_TEST_RAW_EMPTY");
    }

    #[test]
    fn test_flag_explicit_off_beats_true_default() {
        std::env::set_var("WEFT_TEST_FLAG", "off");
        assert!(!flag("test.flag", true));

        std::env::set_var("WEFT_TEST_FLAG", "YES");
        assert!(flag("test.flag", false));

        std::env::set_var("WEFT_TEST_FLAG", "maybe");
        assert!(flag("test.flag", true));
        assert!(!flag("test.flag", false));

        std::env::remove_var("WEFT_TEST_FLAG");
        assert!(flag("test.flag", true));
    }
}
