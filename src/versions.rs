//! Loose semantic version comparison used by the `semver*` condition operators.
//!
//! Accepts an optional `v` (or range operator) prefix, one to four numeric segments where `x`/`*`
//! act as wildcards, an optional pre-release and an ignored build suffix: `v1`, `1.2`, `1.2.x`,
//! `1.2.3.4`, `1.2.3-beta.1+build.5`.

use std::{cmp::Ordering, sync::OnceLock};

use regex::Regex;
use semver::{Prerelease, Version};

use crate::{Error, Result};

const VERSION_PATTERN: &str = r"(?i)^[v^~<>=]*?(\d+)(?:\.([x*]|\d+)(?:\.([x*]|\d+)(?:\.([x*]|\d+))?(?:-([\da-z\-]+(?:\.[\da-z\-]+)*))?(?:\+[\da-z\-]+(?:\.[\da-z\-]+)*)?)?)?$";

fn version_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(VERSION_PATTERN).ok())
        .as_ref()
}

/// Numeric segment, or `None` for a wildcard. Missing segments are `Some(0)`.
type Segment = Option<u64>;

struct LooseVersion {
    segments: [Segment; 4],
    pre: Prerelease,
}

fn parse(version: &str) -> Result<LooseVersion> {
    let invalid = || Error::InvalidVersion(version.to_owned());
    let captures = version_regex()
        .and_then(|regex| regex.captures(version))
        .ok_or_else(invalid)?;

    let mut segments = [Some(0); 4];
    for (i, segment) in segments.iter_mut().enumerate() {
        *segment = match captures.get(i + 1).map(|m| m.as_str()) {
            None => Some(0),
            Some("x" | "X" | "*") => None,
            Some(digits) => Some(digits.parse().map_err(|_| invalid())?),
        };
    }

    let pre = match captures.get(5) {
        Some(pre) => Prerelease::new(pre.as_str()).map_err(|_| invalid())?,
        None => Prerelease::EMPTY,
    };

    Ok(LooseVersion { segments, pre })
}

/// Compare two version strings.
///
/// A wildcard matches any segment at its position. Build metadata is ignored.
///
/// ```
/// # use std::cmp::Ordering;
/// # use eventvisor::compare_versions;
/// assert_eq!(compare_versions("1.10.0", "1.9").unwrap(), Ordering::Greater);
/// assert_eq!(compare_versions("1.2.3", "1.2.x").unwrap(), Ordering::Equal);
/// assert_eq!(compare_versions("1.0.0-rc.1", "1.0.0").unwrap(), Ordering::Less);
/// ```
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    let a = parse(a)?;
    let b = parse(b)?;

    // Wildcards on either side pin both to zero at that position.
    let mut left = [0; 4];
    let mut right = [0; 4];
    for i in 0..4 {
        if let (Some(a), Some(b)) = (a.segments[i], b.segments[i]) {
            left[i] = a;
            right[i] = b;
        }
    }

    let core = |s: &[u64; 4]| Version::new(s[0], s[1], s[2]);
    Ok(core(&left)
        .cmp(&core(&right))
        .then(left[3].cmp(&right[3]))
        .then_with(|| a.pre.cmp(&b.pre)))
}
