//! Name encoding for container identifiers.
//!
//! `encode_name` is total and deterministic but not injective: `a-b` and
//! `a_b` encode to the same string. The orchestrator rejects plans where two
//! jobs collide after encoding.

use std::sync::LazyLock;

use regex::Regex;

static VERSION_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\d^=v<>~]|[*xX]$)").expect("invalid version regex"));

/// Sanitize a name so it can be used as a container or global identifier.
///
/// `@` becomes `scope_`, `-` becomes `_` and `/` becomes `__`; every other
/// character is kept.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    for ch in name.chars() {
        match ch {
            '@' => out.push_str("scope_"),
            '-' => out.push('_'),
            '/' => out.push_str("__"),
            other => out.push(other),
        }
    }
    out
}

/// Whether a shared shorthand value reads as a version range rather than a
/// module request.
pub fn is_required_version(value: &str) -> bool {
    VERSION_LIKE.is_match(value)
}
