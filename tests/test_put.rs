use registry_image::{
    config::EnvSnapshot,
    resource::{put, PutRequest},
    RegistryImageError,
};
use tempfile::tempdir;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_put_pushes_all_tags_from_one_write() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_push_endpoints(&server).await;

    for tag in ["latest", "additional", "tags"] {
        Mock::given(method("PUT"))
            .and(path(format!("/v2/test/image/manifests/{}", tag)))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
    }

    let src = tempdir()?;
    helper::write_image_tarball(src.path(), "image.tar")?;
    std::fs::write(src.path().join("extra-tags"), "additional\ntags\n")?;

    let request = helper::put_request(
        &server,
        serde_json::json!({
            "image": "image.tar",
            "additional_tags": "extra-tags"
        }),
    );
    let response = put(&request, src.path(), &helper::test_env(), None).await?;

    assert_eq!(response.version.tag.as_deref(), Some("latest"));
    assert!(response.version.digest.starts_with("sha256:"));

    let tags = response
        .metadata
        .iter()
        .find(|field| field.name == "tags")
        .map(|field| field.value.clone())
        .unwrap_or_default();
    assert_eq!(tags, "latest additional tags");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_put_bumps_alias_tags_for_release_versions() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_push_endpoints(&server).await;

    Mock::given(method("GET"))
        .and(path("/v2/test/image/tags/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "test/image",
            "tags": ["1.0.0"]
        })))
        .mount(&server)
        .await;

    for tag in ["latest", "1.1.0", "1.1", "1"] {
        Mock::given(method("PUT"))
            .and(path(format!("/v2/test/image/manifests/{}", tag)))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
    }

    let src = tempdir()?;
    helper::write_image_tarball(src.path(), "image.tar")?;

    let request = helper::put_request(
        &server,
        serde_json::json!({
            "image": "image.tar",
            "version": "1.1.0",
            "bump_aliases": true
        }),
    );
    let response = put(&request, src.path(), &helper::test_env(), None).await?;

    let tags = response
        .metadata
        .iter()
        .find(|field| field.name == "tags")
        .map(|field| field.value.clone())
        .unwrap_or_default();
    assert_eq!(tags, "latest 1.1.0 1.1 1");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_put_rejects_ambiguous_image_globs() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    let src = tempdir()?;
    helper::write_image_tarball(src.path(), "one.tar")?;
    helper::write_image_tarball(src.path(), "two.tar")?;

    let request = helper::put_request(&server, serde_json::json!({"image": "*.tar"}));
    let error = put(&request, src.path(), &helper::test_env(), None)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        RegistryImageError::ImageGlobMatches { count: 2, .. }
    ));

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

mod helper {
    use super::*;

    pub fn test_env() -> EnvSnapshot {
        EnvSnapshot::from_vars([("TEST", "1")])
    }

    /// Registry endpoints shared by every push: ping, blob probes, uploads.
    pub async fn mount_push_endpoints(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;

        // Nothing is ever present, so every blob uploads exactly once.
        Mock::given(method("HEAD"))
            .and(path_regex(r"^/v2/test/image/blobs/.*"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v2/test/image/blobs/uploads/"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", "/v2/test/image/blobs/uploads/session"),
            )
            .mount(server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/v2/test/image/blobs/uploads/session"))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
    }

    /// Writes a docker-save style tarball with one layer.
    pub fn write_image_tarball(dir: &std::path::Path, name: &str) -> anyhow::Result<()> {
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []}
        }))?;

        let layer = {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "hello.txt", &b"hello"[..])?;
            builder.into_inner()?
        };

        let manifest = serde_json::to_vec(&serde_json::json!([{
            "Config": "config.json",
            "RepoTags": ["test/image:latest"],
            "Layers": ["layer.tar"]
        }]))?;

        let file = std::fs::File::create(dir.join(name))?;
        let mut builder = tar::Builder::new(file);
        append_bytes(&mut builder, "config.json", &config)?;
        append_bytes(&mut builder, "layer.tar", &layer)?;
        append_bytes(&mut builder, "manifest.json", &manifest)?;
        builder.finish()?;

        Ok(())
    }

    pub fn put_request(server: &MockServer, params: serde_json::Value) -> PutRequest {
        let host = server.uri().replace("http://", "");
        serde_json::from_value(serde_json::json!({
            "source": {
                "repository": format!("{}/test/image", host),
                "insecure": true
            },
            "params": params
        }))
        .unwrap()
    }

    fn append_bytes(
        builder: &mut tar::Builder<std::fs::File>,
        name: &str,
        contents: &[u8],
    ) -> anyhow::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents)?;
        Ok(())
    }
}
