//! Semantic-version parsing and ordering
//!
//! Manifests pin versions with range operators (`^1.2.3`, `~0.4.0`,
//! `>=2.0.0`, `v1.0.0`); registries return bare versions. Everything is
//! normalized to a `major.minor.patch` triple before comparison, and
//! anything that does not normalize is treated as incomparable.

/// Strip range operators and other leading noise down to the first digit.
///
/// `"^1.2.3"` → `"1.2.3"`, `">= 0.4.0"` → `"0.4.0"`. Returns an empty
/// string when there is no digit at all.
pub fn normalize(raw: &str) -> &str {
    match raw.find(|c: char| c.is_ascii_digit()) {
        Some(idx) => raw[idx..].trim(),
        None => "",
    }
}

/// Parse a version string into a `(major, minor, patch)` triple.
///
/// Accepts a leading `v` and ignores any prerelease suffix on the patch
/// component (`1.2.3-beta.1` parses as `(1, 2, 3)`). Returns `None` for
/// anything with fewer than three numeric parts.
pub fn parse(v: &str) -> Option<(u64, u64, u64)> {
    let parts: Vec<&str> = v.trim().trim_start_matches('v').split('.').collect();
    if parts.len() >= 3 {
        Some((
            parts[0].parse().ok()?,
            parts[1].parse().ok()?,
            parts[2].split(['-', '+']).next()?.parse().ok()?,
        ))
    } else {
        None
    }
}

/// True when `pinned` normalizes to a comparable version.
pub fn is_valid(pinned: &str) -> bool {
    parse(normalize(pinned)).is_some()
}

/// Compare two version strings.
/// Returns true only when `latest` is strictly newer than `current`.
pub fn is_upgrade(latest: &str, current: &str) -> bool {
    match (parse(normalize(latest)), parse(normalize(current))) {
        (Some((l_major, l_minor, l_patch)), Some((c_major, c_minor, c_patch))) => {
            (l_major, l_minor, l_patch) > (c_major, c_minor, c_patch)
        }
        _ => false,
    }
}
