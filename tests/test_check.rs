use registry_image::{
    config::EnvSnapshot,
    resource::{check, CheckRequest},
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LATEST_DIGEST: &str =
    "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const OLDER_DIGEST: &str =
    "sha256:7dabed00000000000000000000000000000000000000000000000000000000a9";
const INVALID_DIGEST: &str =
    "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_check_static_image_without_cursor() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_ping(&server).await;
    helper::mount_manifest_head(&server, "latest", LATEST_DIGEST).await;

    let request = helper::check_request(&server, r#""latest""#, None);
    let versions = check(&request, &helper::test_env()).await?;

    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].digest, LATEST_DIGEST);
    assert_eq!(versions[0].tag, None);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_stale_cursor_reports_both_versions() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_ping(&server).await;
    helper::mount_manifest_head(&server, "latest", LATEST_DIGEST).await;
    helper::mount_manifest_head(&server, OLDER_DIGEST, OLDER_DIGEST).await;

    let request = helper::check_request(
        &server,
        r#""latest""#,
        Some(serde_json::json!({"digest": OLDER_DIGEST})),
    );
    let versions = check(&request, &helper::test_env()).await?;

    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].digest, OLDER_DIGEST);
    assert_eq!(versions[1].digest, LATEST_DIGEST);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_invalid_cursor_is_dropped() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_ping(&server).await;
    helper::mount_manifest_head(&server, "latest", LATEST_DIGEST).await;
    helper::mount_manifest_missing(&server, INVALID_DIGEST).await;

    let request = helper::check_request(
        &server,
        r#""latest""#,
        Some(serde_json::json!({"digest": INVALID_DIGEST})),
    );
    let versions = check(&request, &helper::test_env()).await?;

    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].digest, LATEST_DIGEST);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_missing_tag_is_empty() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_ping(&server).await;
    helper::mount_manifest_missing(&server, "not-exist-image").await;

    let request = helper::check_request(&server, r#""not-exist-image""#, None);
    let versions = check(&request, &helper::test_env()).await?;

    assert!(versions.is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_retries_rate_limited_responses() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    Mock::given(method("HEAD"))
        .and(path("/v2/concourse/test-image-static/manifests/latest"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/v2/concourse/test-image-static/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Docker-Content-Digest", LATEST_DIGEST),
        )
        .mount(&server)
        .await;

    let request = helper::check_request(&server, r#""latest""#, None);
    let versions = check(&request, &helper::test_env()).await?;

    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].digest, LATEST_DIGEST);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_repository_scan_orders_by_semver() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_ping(&server).await;
    helper::mount_tags(&server, &["1.1.0", "latest", "1.0.0", "frog"]).await;

    let one_zero = "sha256:1000000000000000000000000000000000000000000000000000000000000000";
    let one_one = "sha256:1100000000000000000000000000000000000000000000000000000000000000";
    helper::mount_manifest_head(&server, "1.0.0", one_zero).await;
    helper::mount_manifest_head(&server, "1.1.0", one_one).await;
    // latest shares the digest of the newest semver tag
    helper::mount_manifest_head(&server, "latest", one_one).await;

    let request = helper::check_request_without_tag(&server, None);
    let versions = check(&request, &helper::test_env()).await?;

    // The bare tag's digest is already represented, so it is not duplicated.
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].tag.as_deref(), Some("1.0.0"));
    assert_eq!(versions[0].digest, one_zero);
    assert_eq!(versions[1].tag.as_deref(), Some("1.1.0"));
    assert_eq!(versions[1].digest, one_one);

    // Idempotency: an unchanged registry yields the identical list.
    let again = check(&request, &helper::test_env()).await?;
    assert_eq!(again, versions);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_repository_scan_appends_distinct_bare_tag() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_ping(&server).await;
    helper::mount_tags(&server, &["2.0.0", "latest"]).await;

    let two_zero = "sha256:2000000000000000000000000000000000000000000000000000000000000000";
    let bare = "sha256:2222222222222222222222222222222222222222222222222222222222222222";
    helper::mount_manifest_head(&server, "2.0.0", two_zero).await;
    helper::mount_manifest_head(&server, "latest", bare).await;

    let request = helper::check_request_without_tag(&server, None);
    let versions = check(&request, &helper::test_env()).await?;

    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].tag.as_deref(), Some("2.0.0"));
    assert_eq!(versions[1].tag.as_deref(), Some("latest"));
    assert_eq!(versions[1].digest, bare);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_repository_scan_prunes_below_cursor() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    helper::mount_ping(&server).await;
    helper::mount_tags(&server, &["1.0.0", "1.1.0", "1.2.0", "latest"]).await;

    let one_one = "sha256:1100000000000000000000000000000000000000000000000000000000000000";
    let one_two = "sha256:1200000000000000000000000000000000000000000000000000000000000000";
    helper::mount_manifest_head(&server, "1.1.0", one_one).await;
    helper::mount_manifest_head(&server, "1.2.0", one_two).await;
    helper::mount_manifest_head(&server, "latest", one_two).await;

    // The tag below the cursor must not even be HEADed.
    Mock::given(method("HEAD"))
        .and(path("/v2/concourse/test-image-static/manifests/1.0.0"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/concourse/test-image-static/manifests/1.0.0"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let request = helper::check_request_without_tag(
        &server,
        Some(serde_json::json!({"tag": "1.1.0", "digest": one_one})),
    );
    let versions = check(&request, &helper::test_env()).await?;

    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].tag.as_deref(), Some("1.1.0"));
    assert_eq!(versions[1].tag.as_deref(), Some("1.2.0"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_check_mirror_is_bypassed_for_explicit_registry() -> anyhow::Result<()> {
    let origin = MockServer::start().await;
    let mirror = MockServer::start().await;

    helper::mount_ping(&origin).await;
    helper::mount_manifest_head(&origin, "latest", LATEST_DIGEST).await;

    let origin_host = origin.uri().replace("http://", "");
    let mirror_host = mirror.uri().replace("http://", "");
    let request: CheckRequest = serde_json::from_value(serde_json::json!({
        "source": {
            "repository": format!("{}/concourse/test-image-static", origin_host),
            "tag": "latest",
            "insecure": true,
            "registry_mirror": {"host": mirror_host}
        }
    }))?;

    let versions = check(&request, &helper::test_env()).await?;
    assert_eq!(versions.len(), 1);

    // The mirror saw no traffic at all.
    assert!(mirror.received_requests().await.unwrap_or_default().is_empty());

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

    pub async fn mount_ping(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    pub async fn mount_manifest_head(server: &MockServer, reference: &str, digest: &str) {
        Mock::given(method("HEAD"))
            .and(path(format!(
                "/v2/concourse/test-image-static/manifests/{}",
                reference
            )))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Docker-Content-Digest", digest),
            )
            .mount(server)
            .await;
    }

    pub async fn mount_manifest_missing(server: &MockServer, reference: &str) {
        for verb in ["HEAD", "GET"] {
            Mock::given(method(verb))
                .and(path(format!(
                    "/v2/concourse/test-image-static/manifests/{}",
                    reference
                )))
                .respond_with(ResponseTemplate::new(404))
                .mount(server)
                .await;
        }
    }

    pub async fn mount_tags(server: &MockServer, tags: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/v2/concourse/test-image-static/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "concourse/test-image-static",
                "tags": tags
            })))
            .mount(server)
            .await;
    }

    pub fn check_request(
        server: &MockServer,
        tag_json: &str,
        version: Option<serde_json::Value>,
    ) -> CheckRequest {
        let host = server.uri().replace("http://", "");
        let mut request = serde_json::json!({
            "source": {
                "repository": format!("{}/concourse/test-image-static", host),
                "tag": serde_json::from_str::<serde_json::Value>(tag_json).unwrap(),
                "insecure": true
            }
        });
        if let Some(version) = version {
            request["version"] = version;
        }
        serde_json::from_value(request).unwrap()
    }

    pub fn check_request_without_tag(
        server: &MockServer,
        version: Option<serde_json::Value>,
    ) -> CheckRequest {
        let host = server.uri().replace("http://", "");
        let mut request = serde_json::json!({
            "source": {
                "repository": format!("{}/concourse/test-image-static", host),
                "insecure": true
            }
        });
        if let Some(version) = version {
            request["version"] = version;
        }
        serde_json::from_value(request).unwrap()
    }
}
