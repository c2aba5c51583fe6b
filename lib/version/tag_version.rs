use getset::Getters;
use semver::Version as SemverVersion;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A tag parsed as a semantic version, keeping the original string.
///
/// Tags in the wild drop components (`3.2`, `1`) and carry a leading `v`; both
/// are accepted by padding the missing components with zeros. The original
/// string stays relevant after parsing: its dot count is the specificity used
/// to break ties between tags that compare equal as semver (`3.2.1` is more
/// specific than `3.2`, `1.0.0-rc.2` more specific than `1.0.0-rc`).
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct TagVersion {
    /// The parsed, zero-padded version.
    version: SemverVersion,

    /// The tag string the version was parsed from, variant suffix removed.
    original: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TagVersion {
    /// Parses a tag tolerantly, accepting partial versions and a `v` prefix.
    /// Returns `None` for tags that are not versions at all.
    pub fn parse_tolerant(tag: &str) -> Option<Self> {
        let trimmed = tag.strip_prefix('v').unwrap_or(tag);

        let (rest, build) = match trimmed.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (trimmed, None),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, prerelease)) => (core, Some(prerelease)),
            None => (rest, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return None;
        }

        let mut numbers = Vec::with_capacity(3);
        for part in &parts {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            numbers.push(part.parse::<u64>().ok()?);
        }
        while numbers.len() < 3 {
            numbers.push(0);
        }

        let mut canonical = format!("{}.{}.{}", numbers[0], numbers[1], numbers[2]);
        if let Some(prerelease) = prerelease {
            canonical.push('-');
            canonical.push_str(prerelease);
        }
        if let Some(build) = build {
            canonical.push('+');
            canonical.push_str(build);
        }

        let version = SemverVersion::parse(&canonical).ok()?;
        Some(Self {
            version,
            original: tag.to_string(),
        })
    }

    /// How specific the original tag string was, measured as its dot count.
    pub fn specificity(&self) -> usize {
        self.original.matches('.').count()
    }

    /// Whether this version carries no prerelease component.
    pub fn is_release(&self) -> bool {
        self.version.pre.is_empty()
    }

    /// Whether this version should replace `other` as the representative of a
    /// shared digest: a release beats a prerelease, and among equals the more
    /// specific original wins.
    pub fn prefer_over(&self, other: &Self) -> bool {
        if self.is_release() != other.is_release() {
            return self.is_release();
        }
        self.specificity() > other.specificity()
    }

    /// Whether a tag at this version may be pruned without a HEAD request,
    /// given the version the cursor parsed to: anything lesser, or equal but
    /// less specific, cannot advance the cursor.
    pub fn at_or_below_cursor(&self, cursor: &Self) -> bool {
        self.version < cursor.version
            || (self.version == cursor.version && self.specificity() < cursor.specificity())
    }

    /// Whether the prerelease component, if any, is admissible.
    ///
    /// Only `alpha`, `beta`, and `rc` prereleases ever surface, and only when
    /// the source opts in. A `-` inside the prerelease denotes an additional
    /// variant and disqualifies the tag entirely.
    pub fn admissible_prerelease(&self, pre_releases: bool) -> bool {
        let prerelease = self.version.pre.as_str();
        if prerelease.is_empty() {
            return true;
        }
        if !pre_releases || prerelease.contains('-') {
            return false;
        }

        let first = prerelease.split('.').next().unwrap_or_default();
        let stem = first.trim_end_matches(|c: char| c.is_ascii_digit());
        matches!(stem, "alpha" | "beta" | "rc")
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a tag as a scan candidate, removing the variant suffix first.
///
/// With a variant configured, only tags ending in `-<variant>` are candidates.
pub fn parse_candidate(tag: &str, variant: Option<&str>) -> Option<TagVersion> {
    match variant {
        Some(variant) => {
            let bare = tag.strip_suffix(&format!("-{}", variant))?;
            TagVersion::parse_tolerant(bare)
        }
        None => TagVersion::parse_tolerant(tag),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_version_parses_partial_versions() {
        let version = TagVersion::parse_tolerant("3.2").unwrap();
        assert_eq!(version.get_version().to_string(), "3.2.0");
        assert_eq!(version.specificity(), 1);

        let version = TagVersion::parse_tolerant("1").unwrap();
        assert_eq!(version.get_version().to_string(), "1.0.0");
        assert_eq!(version.specificity(), 0);
    }

    #[test]
    fn test_tag_version_parses_v_prefix_and_prerelease() {
        let version = TagVersion::parse_tolerant("v2.3.4").unwrap();
        assert_eq!(version.get_version().to_string(), "2.3.4");

        let version = TagVersion::parse_tolerant("1.0.0-rc.2").unwrap();
        assert_eq!(version.get_version().pre.as_str(), "rc.2");
        assert_eq!(version.specificity(), 3);
    }

    #[test]
    fn test_tag_version_rejects_non_versions() {
        assert!(TagVersion::parse_tolerant("latest").is_none());
        assert!(TagVersion::parse_tolerant("1.2.3.4").is_none());
        assert!(TagVersion::parse_tolerant("1.x").is_none());
        assert!(TagVersion::parse_tolerant("").is_none());
    }

    #[test]
    fn test_tag_version_release_beats_prerelease() {
        let release = TagVersion::parse_tolerant("1.0.0").unwrap();
        let prerelease = TagVersion::parse_tolerant("1.0.0-rc.1").unwrap();
        assert!(release.prefer_over(&prerelease));
        assert!(!prerelease.prefer_over(&release));
    }

    #[test]
    fn test_tag_version_specificity_breaks_ties() {
        let specific = TagVersion::parse_tolerant("3.2.1").unwrap();
        let loose = TagVersion::parse_tolerant("3.2").unwrap();
        // Different versions entirely, but the preference only applies to equals.
        assert_ne!(specific.get_version(), loose.get_version());

        let padded = TagVersion::parse_tolerant("3.2.0").unwrap();
        assert!(padded.prefer_over(&loose));
        assert!(!loose.prefer_over(&padded));

        // The longer prerelease form wins between rc.2 and rc.2.0.
        let short = TagVersion::parse_tolerant("1.0.0-rc.2").unwrap();
        let long = TagVersion::parse_tolerant("1.0.0-rc.2.0").unwrap();
        assert!(long.prefer_over(&short));
    }

    #[test]
    fn test_tag_version_cursor_pruning() {
        let cursor = TagVersion::parse_tolerant("2.0.0").unwrap();
        assert!(TagVersion::parse_tolerant("1.9.0")
            .unwrap()
            .at_or_below_cursor(&cursor));
        assert!(TagVersion::parse_tolerant("2.0")
            .unwrap()
            .at_or_below_cursor(&cursor));
        assert!(!TagVersion::parse_tolerant("2.0.0")
            .unwrap()
            .at_or_below_cursor(&cursor));
        assert!(!TagVersion::parse_tolerant("2.0.1")
            .unwrap()
            .at_or_below_cursor(&cursor));
    }

    #[test]
    fn test_tag_version_prerelease_admission() {
        let rc = TagVersion::parse_tolerant("1.0.0-rc.1").unwrap();
        assert!(rc.admissible_prerelease(true));
        assert!(!rc.admissible_prerelease(false));

        let alpha = TagVersion::parse_tolerant("1.0.0-alpha").unwrap();
        assert!(alpha.admissible_prerelease(true));

        let other = TagVersion::parse_tolerant("1.0.0-nightly.1").unwrap();
        assert!(!other.admissible_prerelease(true));

        // A dash inside the prerelease denotes a variant, never a prerelease.
        let variant = TagVersion::parse_tolerant("1.0.0-rc.1-alpine").unwrap();
        assert!(!variant.admissible_prerelease(true));

        let release = TagVersion::parse_tolerant("1.0.0").unwrap();
        assert!(release.admissible_prerelease(false));
    }

    #[test]
    fn test_parse_candidate_variant_filter() {
        assert!(parse_candidate("1.2.3-alpine", Some("alpine")).is_some());
        assert!(parse_candidate("1.2.3", Some("alpine")).is_none());
        assert!(parse_candidate("alpine", Some("alpine")).is_none());
        assert!(parse_candidate("1.2.3", None).is_some());
    }
}
