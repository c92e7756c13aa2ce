//! Lenient repair for event payloads that are almost JSON.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static BARE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)(\w+)(\s*:)").unwrap());

/// Wraps unquoted object keys in double quotes: `{a: 1, b: 2}` becomes
/// `{"a": 1, "b": 2}`. Keys that are already quoted are left alone.
///
/// The pattern is purely textual, so a `,word:` sequence inside a string
/// value is quoted too. It only runs after a strict parse has failed.
pub fn quote_bare_keys(payload: &str) -> Cow<'_, str> {
    BARE_KEY.replace_all(payload, r#"$1"$2"$3"#)
}
