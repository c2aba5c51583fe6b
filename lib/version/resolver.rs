use std::collections::{hash_map::Entry, HashMap};

use crate::{
    config::{Source, Version},
    registry::RegistryClient,
    version::{parse_candidate, TagVersion},
    RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves the ordered set of versions a check reports.
///
/// With a configured tag the repository is tracked through that single tag's
/// digest; otherwise the whole tag namespace is scanned and ordered by semver.
pub async fn resolve_versions(
    client: &RegistryClient,
    source: &Source,
    cursor: Option<&Version>,
) -> RegistryImageResult<Vec<Version>> {
    match source.get_tag() {
        Some(tag) => track_single_tag(client, tag.as_str(), cursor).await,
        None => scan_repository(client, source, cursor).await,
    }
}

/// Tracks one tag by digest.
///
/// A still-valid cursor digest that differs from the tag's current digest is
/// reported before the current one, so the invoker sees the intermediate
/// version it has not processed yet. A cursor whose digest no longer exists is
/// dropped silently.
async fn track_single_tag(
    client: &RegistryClient,
    tag: &str,
    cursor: Option<&Version>,
) -> RegistryImageResult<Vec<Version>> {
    let Some(current_digest) = client.head_or_get(tag).await? else {
        return Ok(Vec::new());
    };

    let current = Version::from_digest(current_digest.clone());

    if let Some(from) = cursor {
        if from.digest != current_digest
            && client.head_or_get(&from.digest).await?.is_some()
        {
            return Ok(vec![from.clone(), current]);
        }
    }

    Ok(vec![current])
}

/// Scans the repository's tags for semver versions.
///
/// The cursor's tag is processed first so its parsed version can prune HEAD
/// requests for tags that cannot advance the cursor. Tags sharing a digest
/// collapse to one version, preferring releases over prereleases and then the
/// more specific original string. The bare tag (`latest` or the variant) is
/// appended at the very end when its digest is not already represented and no
/// semver constraint is in play.
async fn scan_repository(
    client: &RegistryClient,
    source: &Source,
    cursor: Option<&Version>,
) -> RegistryImageResult<Vec<Version>> {
    let bare_tag = source.bare_tag();
    let variant = source.get_variant().as_deref();
    let pre_releases = *source.get_pre_releases();
    let constraint = source.parsed_semver_constraint()?;

    let mut tags = client.list_tags().await?;

    let cursor_tag = cursor.and_then(|version| version.tag.clone());
    if let Some(cursor_tag) = &cursor_tag {
        if let Some(position) = tags.iter().position(|tag| tag == cursor_tag) {
            let tag = tags.remove(position);
            tags.insert(0, tag);
        }
    }

    let mut cursor_version: Option<TagVersion> = None;
    let mut bare_digest: Option<String> = None;
    // digest → the version chosen to represent it
    let mut digest_versions: HashMap<String, (TagVersion, String)> = HashMap::new();

    for tag in &tags {
        let is_bare = tag.as_str() == bare_tag;

        let Some(tag_version) = parse_candidate(tag, variant) else {
            if is_bare {
                bare_digest = client.head_or_get(tag).await?;
            }
            continue;
        };

        if let Some(constraint) = &constraint {
            if !constraint.matches(tag_version.get_version()) {
                continue;
            }
        }
        if !tag_version.admissible_prerelease(pre_releases) {
            continue;
        }

        let is_cursor_tag = cursor_tag.as_deref() == Some(tag.as_str());
        if !is_cursor_tag {
            if let Some(cursor_version) = &cursor_version {
                if tag_version.at_or_below_cursor(cursor_version) {
                    continue;
                }
            }
        }

        let Some(digest) = client.head_or_get(tag).await? else {
            continue;
        };

        if is_cursor_tag {
            cursor_version = Some(tag_version.clone());
        }

        match digest_versions.entry(digest) {
            Entry::Occupied(mut entry) => {
                if tag_version.prefer_over(&entry.get().0) {
                    entry.insert((tag_version, tag.clone()));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert((tag_version, tag.clone()));
            }
        }
    }

    let mut entries: Vec<(String, TagVersion, String)> = digest_versions
        .into_iter()
        .map(|(digest, (version, tag))| (digest, version, tag))
        .collect();
    entries.sort_by(|a, b| {
        a.1.get_version()
            .cmp(b.1.get_version())
            .then_with(|| a.1.specificity().cmp(&b.1.specificity()))
            .then_with(|| a.2.cmp(&b.2))
    });

    let mut versions: Vec<Version> = entries
        .into_iter()
        .map(|(digest, _, tag)| Version::new(tag, digest))
        .collect();

    if constraint.is_none() {
        if let Some(bare_digest) = bare_digest {
            if !versions.iter().any(|version| version.digest == bare_digest) {
                versions.push(Version::new(bare_tag, bare_digest));
            }
        }
    }

    Ok(versions)
}
