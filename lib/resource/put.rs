use std::path::{Path, PathBuf};

use crate::{
    auth::{self, AuthScope},
    config::{EnvSnapshot, MetadataField, Version, DEFAULT_TAG},
    materialize::load_image,
    reference::RepositoryRef,
    registry::RegistryClient,
    resource::{ContentTrustSigner, PutRequest, ResourceResponse},
    transport::build_http_client,
    version::{parse_candidate, TagVersion},
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Publishes the image tarball under every planned tag.
///
/// Tags come from three places: the source's tag (defaulting to `latest`),
/// the params version (optionally with the variant suffix and its alias
/// bumps), and the whitespace-separated additional-tags file. Blobs upload
/// once; all tags then point at the same digest. The optional content-trust
/// callback runs per tag and never fails the push.
pub async fn put(
    request: &PutRequest,
    src_dir: &Path,
    env: &EnvSnapshot,
    signer: Option<&dyn ContentTrustSigner>,
) -> RegistryImageResult<ResourceResponse> {
    let source = &request.source;
    let params = &request.params;

    let repository: RepositoryRef = source.get_repository().parse()?;
    let http = build_http_client(source.get_domain_certs(), *source.get_insecure(), env)?;

    let resolved = auth::resolve(source, &repository, &http, env).await?;
    let repository = match resolved.get_registry_override() {
        Some(host) => repository.with_registry(host.clone())?,
        None => repository,
    };

    let client = RegistryClient::connect(
        http,
        &repository,
        resolved.get_credential().clone(),
        AuthScope::Push,
        *source.get_insecure(),
    )
    .await?;

    let image_path = resolve_image_glob(src_dir, params.get_image())?;
    let loaded = load_image(&image_path).await?;

    let mut tags: Vec<String> = Vec::new();
    let mut push_tag = |tag: String| {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    push_tag(
        source
            .get_tag()
            .as_ref()
            .map(|tag| tag.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_TAG.to_string()),
    );

    if let Some(version_string) = params.get_version() {
        let parsed = TagVersion::parse_tolerant(version_string).ok_or_else(|| {
            RegistryImageError::config(format!("cannot parse version: {}", version_string))
        })?;

        push_tag(with_variant(version_string, source.get_variant().as_deref()));

        if *params.get_bump_aliases() && parsed.is_release() {
            let remote_tags = client.list_tags().await?;
            for alias in plan_aliases(&parsed, &remote_tags, source.get_variant().as_deref()) {
                push_tag(alias);
            }
        }
    }

    if let Some(path) = params.get_additional_tags() {
        for tag in read_additional_tags(src_dir, path).await? {
            push_tag(tag);
        }
    }

    let digest = client
        .multi_write(&tags, loaded.artifact(), &loaded)
        .await?;

    tracing::info!("pushed {} as {} ({})", repository, tags.join(" "), digest);

    if source.get_content_trust().is_some() {
        if let Some(signer) = signer {
            for tag in &tags {
                if let Err(error) = signer
                    .sign(repository.get_repository(), tag, &digest)
                    .await
                {
                    tracing::warn!("signing {}:{} failed: {}", repository, tag, error);
                }
            }
        }
    }

    let version = Version::new(tags[0].clone(), digest);
    let metadata = vec![MetadataField::new("tags", tags.join(" "))];

    Ok(ResourceResponse { version, metadata })
}

/// Resolves the image glob to exactly one file.
fn resolve_image_glob(src_dir: &Path, pattern: &str) -> RegistryImageResult<PathBuf> {
    let full_pattern = src_dir.join(pattern).to_string_lossy().into_owned();
    let matches: Vec<PathBuf> = glob::glob(&full_pattern)?
        .filter_map(Result::ok)
        .collect();

    if matches.len() != 1 {
        return Err(RegistryImageError::ImageGlobMatches {
            pattern: pattern.to_string(),
            count: matches.len(),
        });
    }

    Ok(matches.into_iter().next().unwrap_or_default())
}

/// Reads the whitespace-separated additional-tags file.
async fn read_additional_tags(
    src_dir: &Path,
    path: &Path,
) -> RegistryImageResult<Vec<String>> {
    let full_path = src_dir.join(path);
    let contents = tokio::fs::read_to_string(&full_path)
        .await
        .map_err(|error| RegistryImageError::AdditionalTags {
            path: full_path.clone(),
            reason: error.to_string(),
        })?;

    Ok(contents
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

/// Appends the variant suffix to a version tag.
fn with_variant(version: &str, variant: Option<&str>) -> String {
    match variant {
        Some(variant) => format!("{}-{}", version, variant),
        None => version.to_string(),
    }
}

/// Which of the alias tags the version is entitled to.
///
/// An alias bumps when no non-prerelease tag in its equivalence class is
/// higher than the pushed version: `<major>.<minor>` against the same
/// major.minor, `<major>` against the same major, and the bare alias against
/// the whole namespace.
fn plan_aliases(
    version: &TagVersion,
    remote_tags: &[String],
    variant: Option<&str>,
) -> Vec<String> {
    let pushed = version.get_version();

    let remote_versions: Vec<semver::Version> = remote_tags
        .iter()
        .filter_map(|tag| parse_candidate(tag, variant))
        .filter(TagVersion::is_release)
        .map(|tag_version| tag_version.get_version().clone())
        .collect();

    let mut aliases = Vec::new();

    let minor_taken = remote_versions.iter().any(|remote| {
        remote.major == pushed.major && remote.minor == pushed.minor && remote > pushed
    });
    if !minor_taken {
        aliases.push(with_variant(
            &format!("{}.{}", pushed.major, pushed.minor),
            variant,
        ));
    }

    let major_taken = remote_versions
        .iter()
        .any(|remote| remote.major == pushed.major && remote > pushed);
    if !major_taken {
        aliases.push(with_variant(&pushed.major.to_string(), variant));
    }

    let latest_taken = remote_versions.iter().any(|remote| remote > pushed);
    if !latest_taken {
        aliases.push(match variant {
            Some(variant) => variant.to_string(),
            None => DEFAULT_TAG.to_string(),
        });
    }

    aliases
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn version(tag: &str) -> TagVersion {
        TagVersion::parse_tolerant(tag).unwrap()
    }

    #[test]
    fn test_image_glob_must_match_exactly_one() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.tar"), b"x").unwrap();
        std::fs::write(dir.path().join("b.tar"), b"x").unwrap();

        let err = resolve_image_glob(dir.path(), "*.tar").unwrap_err();
        assert!(matches!(
            err,
            RegistryImageError::ImageGlobMatches { count: 2, .. }
        ));

        let err = resolve_image_glob(dir.path(), "missing/*.tar").unwrap_err();
        assert!(matches!(
            err,
            RegistryImageError::ImageGlobMatches { count: 0, .. }
        ));

        let found = resolve_image_glob(dir.path(), "a.tar").unwrap();
        assert_eq!(found, dir.path().join("a.tar"));
    }

    #[test]
    fn test_plan_aliases_empty_namespace_gets_all() {
        let aliases = plan_aliases(&version("1.2.3"), &[], None);
        assert_eq!(aliases, vec!["1.2", "1", "latest"]);
    }

    #[test]
    fn test_plan_aliases_blocked_by_higher_versions() {
        let remote = vec!["1.2.4".to_string(), "2.0.0".to_string()];
        let aliases = plan_aliases(&version("1.3.0"), &remote, None);
        // 1.3 is the newest of its minor and major lines, but 2.0.0 owns latest.
        assert_eq!(aliases, vec!["1.3", "1"]);

        let aliases = plan_aliases(&version("1.2.3"), &remote, None);
        assert!(aliases.is_empty());
    }

    #[test]
    fn test_plan_aliases_ignores_prereleases() {
        let remote = vec!["2.0.0-rc.1".to_string()];
        let aliases = plan_aliases(&version("1.0.0"), &remote, None);
        assert_eq!(aliases, vec!["1.0", "1", "latest"]);
    }

    #[test]
    fn test_plan_aliases_variant_suffixes() {
        let remote = vec!["1.0.0-alpine".to_string()];
        let aliases = plan_aliases(&version("1.1.0"), &remote, Some("alpine"));
        assert_eq!(aliases, vec!["1.1-alpine", "1-alpine", "alpine"]);
    }
}
