//! Lenient version parsing and range matching.
//!
//! Extension manifests are hand-written, so versions like `"1.2"` or
//! `"v2.0.0"` are accepted, and ranges use the npm style where comparators
//! are separated by spaces and alternatives by `||`.

use semver::{Version, VersionReq};

use crate::error::{HostError, HostResult};

/// Parse a version, padding missing minor/patch components.
pub fn parse_version(input: &str) -> Option<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    // Pad "1" and "1.2" into full triples, keeping any suffix.
    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    Version::parse(&format!("{padded}{suffix}")).ok()
}

/// Parse a version, falling back to `0.0.0`.
pub fn version_or_zero(input: &str) -> Version {
    parse_version(input).unwrap_or_else(|| {
        if !input.trim().is_empty() {
            tracing::debug!(version = input, "Invalid version, treating as 0.0.0");
        }
        Version::new(0, 0, 0)
    })
}

/// A version range: any of several comparator sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    source: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// Parse an npm-style range such as `">=1.2.0 <2.0.0 || ^3"`.
    pub fn parse(input: &str) -> HostResult<Self> {
        let invalid = |message: String| HostError::InvalidVersion {
            input: input.to_string(),
            message,
        };

        let mut alternatives = Vec::new();
        for alternative in input.split("||") {
            let normalized = normalize_comparators(alternative);
            let req = if normalized.is_empty() {
                VersionReq::STAR
            } else {
                VersionReq::parse(&normalized).map_err(|e| invalid(e.to_string()))?
            };
            alternatives.push(req);
        }
        if alternatives.is_empty() {
            return Err(invalid("empty range".to_string()));
        }

        Ok(Self {
            source: input.trim().to_string(),
            alternatives,
        })
    }

    /// Whether `version` is in the range.
    ///
    /// With `include_prerelease`, prerelease versions are compared on their
    /// release triple, so `1.5.0-beta.1` satisfies `>=1.0.0`.
    pub fn matches(&self, version: &Version, include_prerelease: bool) -> bool {
        let stripped;
        let version = if include_prerelease && !version.pre.is_empty() {
            stripped = Version::new(version.major, version.minor, version.patch);
            &stripped
        } else {
            version
        };
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// The range as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Whether `candidate` ranks above `current`. Build metadata does not count.
pub fn is_newer(candidate: &Version, current: &Version) -> bool {
    candidate.cmp_precedence(current) == std::cmp::Ordering::Greater
}

/// Whether `version` satisfies `range`. Unparseable input never satisfies.
pub fn satisfies(version: &str, range: &str, include_prerelease: bool) -> bool {
    match (parse_version(version), VersionRange::parse(range)) {
        (Some(version), Ok(range)) => range.matches(&version, include_prerelease),
        _ => false,
    }
}

/// Turn `">= 1.0.0 <2"` into `">=1.0.0, <2"`.
fn normalize_comparators(input: &str) -> String {
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op = String::new();
    for token in input.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_op.push_str(token);
            continue;
        }
        let token = token.strip_prefix('v').unwrap_or(token);
        comparators.push(format!("{}{}", std::mem::take(&mut pending_op), token));
    }
    comparators.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_lenient() {
        assert_eq!(parse_version("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("v2.0.1"), Some(Version::new(2, 0, 1)));
        assert_eq!(parse_version("1.2"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_version("3"), Some(Version::new(3, 0, 0)));
        assert_eq!(parse_version("1.2-beta").map(|v| v.pre.to_string()), Some("beta".into()));
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("one.two"), None);
        assert_eq!(version_or_zero("garbage"), Version::new(0, 0, 0));
    }

    #[test]
    fn test_is_newer_ignores_build_metadata() {
        let first = Version::parse("1.0.0+build.1").unwrap();
        let second = Version::parse("1.0.0+build.2").unwrap();
        assert!(!is_newer(&second, &first));
        assert!(!is_newer(&first, &second));
        assert!(is_newer(&Version::new(1, 0, 1), &first));
        assert!(is_newer(&first, &Version::parse("1.0.0-rc.1").unwrap()));
    }

    #[test]
    fn test_range_npm_style() {
        let range = VersionRange::parse(">=1.2.0 <2.0.0").unwrap();
        assert!(range.matches(&Version::new(1, 5, 0), false));
        assert!(!range.matches(&Version::new(2, 0, 0), false));

        let range = VersionRange::parse(">= 1.0.0").unwrap();
        assert!(range.matches(&Version::new(1, 0, 0), false));

        let range = VersionRange::parse("^1.0.0 || ^3.0.0").unwrap();
        assert!(range.matches(&Version::new(3, 1, 0), false));
        assert!(!range.matches(&Version::new(2, 1, 0), false));
        assert_eq!(range.to_string(), "^1.0.0 || ^3.0.0");
    }

    #[test]
    fn test_range_invalid() {
        assert!(VersionRange::parse(">=banana").is_err());
        assert!(!satisfies("1.0.0", ">=banana", false));
        assert!(!satisfies("banana", ">=1.0.0", false));
    }

    #[test]
    fn test_prerelease_compared_on_release() {
        let beta = Version::parse("1.5.0-beta.1").unwrap();
        let range = VersionRange::parse(">=1.0.0").unwrap();
        assert!(!range.matches(&beta, false));
        assert!(range.matches(&beta, true));
        assert!(satisfies("1.5.0-beta.1", ">=1.5.0", true));
    }
}
