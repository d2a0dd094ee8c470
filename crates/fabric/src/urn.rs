// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Colon-delimited, percent-encoded tagged records embedded in stdout.
//!
//! An experiment URN starts with the literal `mini` followed by one or
//! more `:`-separated parts. Each part is percent-encoded so that the
//! separator can never appear literally inside a part.

use std::sync::OnceLock;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

/// The character set escaped inside a URN part. Everything outside
/// `[A-Za-z0-9._~-]` is percent-encoded, so `:` and `%` cannot occur
/// literally within a part.
const PART_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'-');

#[allow(clippy::unwrap_used)]
fn experiment_urn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^mini(?::[a-zA-Z0-9%._~-]*)+$").unwrap())
}

/// Check whether a line is an experiment URN: the literal `mini` followed
/// by at least one part.
pub fn is_experiment_urn(urn: &str) -> bool {
    experiment_urn_pattern().is_match(urn)
}

/// Join a sequence of parts into a URN, percent-encoding each part.
pub fn to_urn<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|part| utf8_percent_encode(part.as_ref(), PART_ESCAPE).to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Split a URN into its decoded parts. Empty trailing parts are preserved.
pub fn parse_urn(urn: &str) -> Vec<String> {
    urn.trim()
        .split(':')
        .map(|part| percent_decode_str(part).decode_utf8_lossy().into_owned())
        .collect()
}

/// Check that a URN matches a pattern.
///
/// The pattern is itself a URN whose parts may be the wildcard `*`, which
/// matches any single non-empty part. A pattern shorter than the URN
/// matches any prefix; a pattern longer than the URN does not match.
pub fn matches_urn(urn: &str, pattern: &str) -> bool {
    let parts = parse_urn(urn);
    let spec: Vec<&str> = pattern.split(':').collect();
    for (i, s) in spec.iter().enumerate() {
        let Some(part) = parts.get(i) else {
            return false;
        };
        if *s == "*" {
            if part.is_empty() {
                return false;
            }
            continue;
        }
        let decoded = percent_decode_str(s).decode_utf8_lossy();
        if part.as_str() != decoded.as_ref() {
            return false;
        }
    }
    true
}

/// Generate a short random identifier for use in URNs.
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}

#[cfg(test)]
#[path = "urn_tests.rs"]
mod tests;
