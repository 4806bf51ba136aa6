//! Pattern matching on decoded console output.
//!
//! Console protocols carry no framing, so everything is matched as text:
//! plain substring containment for pass/fail checks, and regex extraction
//! when a structured value (timestamp, identifier) has to be pulled out.

use regex::Regex;

use crate::error::{Error, Result};

/// Compile a user-supplied pattern, reporting failures as configuration errors.
pub fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("invalid pattern '{pattern}': {e}")))
}

/// First match of `pattern` in `text`.
///
/// Returns the first capture group when the pattern has one, the whole match
/// otherwise.
pub fn extract_first(pattern: &Regex, text: &str) -> Option<String> {
    pattern.captures(text).map(|caps| {
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    })
}

/// Every non-overlapping match of `pattern`, using the same group rule as
/// [`extract_first`].
pub fn extract_all(pattern: &Regex, text: &str) -> Vec<String> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// The first needle, in the given order, that does not occur in `text`.
pub fn first_missing<'a, S: AsRef<str>>(text: &str, needles: &'a [S]) -> Option<&'a str> {
    needles
        .iter()
        .map(AsRef::<str>::as_ref)
        .find(|needle| !text.contains(*needle))
}
