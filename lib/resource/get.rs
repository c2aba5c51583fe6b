use std::path::Path;

use reqwest_middleware::ClientWithMiddleware;

use crate::{
    auth::{self, AuthScope},
    config::{EnvSnapshot, GetParams, MaterializeFormat, MetadataField, Source},
    materialize::{extract_rootfs, write_aux_files, write_config_files, write_image_tarball, write_layout},
    reference::RepositoryRef,
    registry::RegistryClient,
    resource::{applicable_mirror, mirror_credential, GetRequest, ResourceResponse},
    transport::build_http_client,
    RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Fetches the requested version into the destination directory.
///
/// Get is cursor-driven: the image is addressed by the version's digest, so a
/// mirror either serves exactly the requested content or the origin is used.
/// The `tag`, `digest`, and `repository` files are always written; with
/// `skip_download` set they are the only output.
pub async fn get(
    request: &GetRequest,
    dest: &Path,
    env: &EnvSnapshot,
) -> RegistryImageResult<ResourceResponse> {
    let source = &request.source;
    let version = &request.version;
    let params = &request.params;

    let repository: RepositoryRef = source.get_repository().parse()?;
    let http = build_http_client(source.get_domain_certs(), *source.get_insecure(), env)?;

    let tag = version
        .tag
        .clone()
        .or_else(|| source.get_tag().as_ref().map(|tag| tag.as_str().to_string()))
        .unwrap_or_else(|| source.bare_tag().to_string());

    write_aux_files(dest, source.get_repository(), &tag, &version.digest).await?;

    let metadata = vec![
        MetadataField::new("repository", source.get_repository()),
        MetadataField::new("tag", &tag),
    ];

    if *params.get_skip_download() {
        return Ok(ResourceResponse {
            version: version.clone(),
            metadata,
        });
    }

    let mut fetched = false;
    if let Some(mirror) = applicable_mirror(source, &repository) {
        let mirror_repository = repository.with_registry(mirror.get_host().clone())?;
        let connect = RegistryClient::connect(
            http.clone(),
            &mirror_repository,
            mirror_credential(mirror),
            AuthScope::Pull,
            *source.get_insecure(),
        );
        let result = match connect.await {
            Ok(client) => {
                materialize_from(&client, source, &version.digest, params, &tag, dest).await
            }
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => fetched = true,
            Err(error) => {
                tracing::warn!(
                    "fetching from mirror {} failed: {}, falling back to {}",
                    mirror.get_host(),
                    error,
                    repository.get_registry()
                );
            }
        }
    }

    if !fetched {
        let client = origin_client(&http, source, &repository, env).await?;
        materialize_from(&client, source, &version.digest, params, &tag, dest).await?;
    }

    Ok(ResourceResponse {
        version: version.clone(),
        metadata,
    })
}

/// Connects to the origin registry with resolved credentials.
async fn origin_client(
    http: &ClientWithMiddleware,
    source: &Source,
    repository: &RepositoryRef,
    env: &EnvSnapshot,
) -> RegistryImageResult<RegistryClient> {
    let resolved = auth::resolve(source, repository, http, env).await?;

    let repository = match resolved.get_registry_override() {
        Some(host) => repository.with_registry(host.clone())?,
        None => repository.clone(),
    };

    RegistryClient::connect(
        http.clone(),
        &repository,
        resolved.get_credential().clone(),
        AuthScope::Pull,
        *source.get_insecure(),
    )
    .await
}

/// Fetches the digest from the connected registry and writes the configured
/// output format.
async fn materialize_from(
    client: &RegistryClient,
    source: &Source,
    digest: &str,
    params: &GetParams,
    tag: &str,
    dest: &Path,
) -> RegistryImageResult<()> {
    let (os, architecture) = requested_platform(params);

    match params.get_format() {
        MaterializeFormat::Rootfs => {
            let image = client.fetch_image(digest, &os, &architecture).await?;
            extract_rootfs(client, &image, dest).await?;
            write_config_files(dest, image.get_config()).await?;
        }
        MaterializeFormat::Oci => {
            let image = client.fetch_image(digest, &os, &architecture).await?;
            // The tarball is tagged with the origin repository, never the mirror.
            let repo_tag = format!("{}:{}", source.get_repository(), tag);
            write_image_tarball(client, &image, &repo_tag, &dest.join("image.tar")).await?;
            write_config_files(dest, image.get_config()).await?;
        }
        MaterializeFormat::OciLayout => {
            let artifact = client.fetch_index_or_image(digest).await?;
            write_layout(client, &artifact, &dest.join("oci")).await?;
        }
    }

    Ok(())
}

/// The platform to select from multi-arch indexes, defaulting to the runtime's.
fn requested_platform(params: &GetParams) -> (String, String) {
    let os = params
        .get_os()
        .clone()
        .unwrap_or_else(|| std::env::consts::OS.to_string());
    let architecture = params
        .get_architecture()
        .clone()
        .unwrap_or_else(|| oci_architecture(std::env::consts::ARCH).to_string());
    (os, architecture)
}

/// Maps Rust's architecture names onto the OCI platform vocabulary.
fn oci_architecture(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oci_architecture_mapping() {
        assert_eq!(oci_architecture("x86_64"), "amd64");
        assert_eq!(oci_architecture("aarch64"), "arm64");
        assert_eq!(oci_architecture("riscv64"), "riscv64");
    }

    #[test]
    fn test_requested_platform_override() {
        let params: GetParams =
            serde_json::from_str(r#"{"os": "linux", "architecture": "arm64"}"#).unwrap();
        assert_eq!(
            requested_platform(&params),
            ("linux".to_string(), "arm64".to_string())
        );
    }
}
