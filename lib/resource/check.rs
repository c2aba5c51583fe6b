use reqwest_middleware::ClientWithMiddleware;

use crate::{
    auth::{self, AuthScope, RegistryCredential},
    config::{EnvSnapshot, RegistryMirror, Source, Version},
    reference::RepositoryRef,
    registry::RegistryClient,
    resource::CheckRequest,
    transport::build_http_client,
    version::resolve_versions,
    RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Discovers the versions of the configured repository.
///
/// With a valid mirror configured, the mirror is consulted first; an empty or
/// failing mirror falls through to the origin registry, and only an origin
/// failure is fatal. The mirror only applies when the repository resolves to
/// the default registry.
pub async fn check(
    request: &CheckRequest,
    env: &EnvSnapshot,
) -> RegistryImageResult<Vec<Version>> {
    let source = &request.source;
    let cursor = request.version.as_ref();

    let repository: RepositoryRef = source.get_repository().parse()?;
    let http = build_http_client(source.get_domain_certs(), *source.get_insecure(), env)?;

    if let Some(mirror) = applicable_mirror(source, &repository) {
        match check_mirror(&http, source, mirror, &repository, cursor).await {
            Ok(versions) if !versions.is_empty() => return Ok(versions),
            Ok(_) => {
                tracing::warn!(
                    "mirror {} returned no versions, falling back to {}",
                    mirror.get_host(),
                    repository.get_registry()
                );
            }
            Err(error) => {
                tracing::warn!(
                    "checking mirror {} failed: {}, falling back to {}",
                    mirror.get_host(),
                    error,
                    repository.get_registry()
                );
            }
        }
    }

    check_origin(&http, source, &repository, cursor, env).await
}

/// The mirror to consult, when one applies to this repository.
pub(crate) fn applicable_mirror<'a>(
    source: &'a Source,
    repository: &RepositoryRef,
) -> Option<&'a RegistryMirror> {
    source
        .get_registry_mirror()
        .as_ref()
        .filter(|_| repository.is_default_registry())
}

/// The credential a mirror is consulted with: its own basic pair or nothing.
/// Cloud credentials are origin-host-specific and never sent to a mirror.
pub(crate) fn mirror_credential(mirror: &RegistryMirror) -> RegistryCredential {
    match (mirror.get_username(), mirror.get_password()) {
        (Some(username), Some(password)) => RegistryCredential::basic(username, password),
        _ => RegistryCredential::Anonymous,
    }
}

async fn check_origin(
    http: &ClientWithMiddleware,
    source: &Source,
    repository: &RepositoryRef,
    cursor: Option<&Version>,
    env: &EnvSnapshot,
) -> RegistryImageResult<Vec<Version>> {
    let resolved = auth::resolve(source, repository, http, env).await?;

    let repository = match resolved.get_registry_override() {
        Some(host) => repository.with_registry(host.clone())?,
        None => repository.clone(),
    };

    let client = RegistryClient::connect(
        http.clone(),
        &repository,
        resolved.get_credential().clone(),
        AuthScope::Pull,
        *source.get_insecure(),
    )
    .await?;

    resolve_versions(&client, source, cursor).await
}

async fn check_mirror(
    http: &ClientWithMiddleware,
    source: &Source,
    mirror: &RegistryMirror,
    repository: &RepositoryRef,
    cursor: Option<&Version>,
) -> RegistryImageResult<Vec<Version>> {
    let mirror_repository = repository.with_registry(mirror.get_host().clone())?;

    let client = RegistryClient::connect(
        http.clone(),
        &mirror_repository,
        mirror_credential(mirror),
        AuthScope::Pull,
        *source.get_insecure(),
    )
    .await?;

    resolve_versions(&client, source, cursor).await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_ignored_for_explicit_registry() {
        let source: Source = serde_json::from_str(
            r#"{
                "repository": "registry.example.com/org/app",
                "registry_mirror": {"host": "mirror.example.com"}
            }"#,
        )
        .unwrap();
        let repository: RepositoryRef = source.get_repository().parse().unwrap();
        assert!(applicable_mirror(&source, &repository).is_none());
    }

    #[test]
    fn test_mirror_applies_for_default_registry() {
        let source: Source = serde_json::from_str(
            r#"{
                "repository": "busybox",
                "registry_mirror": {"host": "mirror.example.com"}
            }"#,
        )
        .unwrap();
        let repository: RepositoryRef = source.get_repository().parse().unwrap();
        assert!(applicable_mirror(&source, &repository).is_some());
    }

    #[test]
    fn test_mirror_credential_requires_both_fields() {
        let mirror: RegistryMirror =
            serde_json::from_str(r#"{"host": "m.example.com", "username": "u"}"#).unwrap();
        assert!(mirror_credential(&mirror).is_anonymous());

        let mirror: RegistryMirror =
            serde_json::from_str(r#"{"host": "m.example.com", "username": "u", "password": "p"}"#)
                .unwrap();
        assert!(!mirror_credential(&mirror).is_anonymous());
    }
}
