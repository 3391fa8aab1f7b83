//! Parsing of `KEY=VALUE,KEY=VALUE` environment strings.

use std::collections::HashMap;

/// Parses a comma-separated list of `KEY=VALUE` pairs.
///
/// Keys and values are trimmed. Segments without `=`, with an empty key, or
/// with an empty value are skipped. Commas and `=` cannot be escaped.
pub fn parse_env(spec: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for segment in spec.split(',') {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        env.insert(key.to_string(), value.to_string());
    }
    env
}
