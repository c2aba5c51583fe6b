use std::{collections::HashSet, path::Path};

use base64::Engine;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use oci_spec::image::{Descriptor, ImageIndex};
use reqwest::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE},
    Method, Response, StatusCode,
};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};

use crate::{
    auth::{AuthScope, RegistryCredential},
    reference::RepositoryRef,
    registry::{
        is_attestation, is_index_media_type, parse_www_authenticate, sha256_digest, AuthChallenge,
        ImageArtifact, ImageIndexOrImage, RegistryToken, TagList, BlobSource,
        DOCKER_MANIFEST_MIME_TYPE, MANIFEST_ACCEPT_HEADER,
    },
    transport::url_scheme,
    config::TAGS_PAGE_SIZE,
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The header registries return manifest digests in.
const DIGEST_HEADER: &str = "Docker-Content-Digest";

const OCTET_STREAM: &str = "application/octet-stream";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for one repository on one registry, speaking the OCI distribution
/// protocol.
///
/// Construction performs the token handshake the registry asks for via its
/// `/v2/` challenge; afterwards every operation reuses the resulting
/// authorization header. All requests go through the retrying transport, so
/// rate limiting is handled below this layer.
///
/// [See the OCI distribution specification for the protocol details][dist-spec]
///
/// [dist-spec]: https://github.com/opencontainers/distribution-spec/blob/main/spec.md
#[derive(Debug)]
pub struct RegistryClient {
    /// The retrying HTTP client requests are issued through.
    client: ClientWithMiddleware,

    /// `https`, or `http` when the source permits insecure registries.
    scheme: &'static str,

    /// The registry host requests are addressed to.
    registry: String,

    /// The repository path within the registry.
    repository: String,

    /// The Authorization header value, once the handshake settled on one.
    auth_header: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryClient {
    /// Connects to the registry, performing the authorization handshake for
    /// the given repository and scope.
    pub async fn connect(
        client: ClientWithMiddleware,
        repository: &RepositoryRef,
        credential: RegistryCredential,
        scope: AuthScope,
        insecure: bool,
    ) -> RegistryImageResult<Self> {
        let scheme = url_scheme(insecure);
        let registry = repository.get_registry().clone();
        let repository = repository.get_repository().clone();

        let ping_url = format!("{}://{}/v2/", scheme, registry);
        let response = client.get(&ping_url).send().await?;

        let auth_header = match response.status() {
            status if status.is_success() => basic_header(&credential),
            StatusCode::UNAUTHORIZED => {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|header| header.to_str().ok())
                    .and_then(parse_www_authenticate);

                match challenge {
                    Some(challenge) if challenge.scheme.eq_ignore_ascii_case("bearer") => Some(
                        fetch_bearer_token(&client, &challenge, &repository, scope, &credential)
                            .await?,
                    ),
                    _ => basic_header(&credential),
                }
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(RegistryImageError::RegistryResponse {
                    status: status.as_u16(),
                    context: format!("ping {}", registry),
                    body,
                });
            }
        };

        Ok(Self {
            client,
            scheme,
            registry,
            repository,
            auth_header,
        })
    }

    /// The registry host this client talks to.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path this client operates on.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Lists every tag in the repository, following pagination until the
    /// registry returns a short page. A missing repository lists as empty.
    pub async fn list_tags(&self) -> RegistryImageResult<Vec<String>> {
        let mut tags = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut last: Option<String> = None;

        loop {
            let mut request = self
                .request(Method::GET, &self.repo_url("tags/list"))
                .query(&[("n", TAGS_PAGE_SIZE.to_string())]);
            if let Some(last) = &last {
                request = request.query(&[("last", last.as_str())]);
            }

            let response = request.send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => return Ok(Vec::new()),
                status if status.is_success() => {}
                _ => return Err(self.response_error("list tags", response).await),
            }

            let page: TagList = response.json().await?;
            let page_tags = page.tags.unwrap_or_default();
            let page_len = page_tags.len();

            let mut grew = false;
            for tag in page_tags {
                if seen.insert(tag.clone()) {
                    tags.push(tag);
                    grew = true;
                }
            }

            // Registries that ignore pagination return the same full page forever.
            if page_len < TAGS_PAGE_SIZE || !grew {
                break;
            }
            last = tags.last().cloned();
        }

        Ok(tags)
    }

    /// Resolves a tag or digest reference to its manifest digest.
    ///
    /// HEAD is tried first; registries that refuse HEAD or omit the digest
    /// header are retried with GET. A missing manifest resolves to `None`
    /// rather than an error.
    pub async fn head_or_get(&self, reference: &str) -> RegistryImageResult<Option<String>> {
        let url = self.repo_url(&format!("manifests/{}", reference));
        let response = self
            .request(Method::HEAD, &url)
            .header(ACCEPT, MANIFEST_ACCEPT_HEADER)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                if let Some(digest) = header_digest(&response) {
                    return Ok(Some(digest));
                }
            }
            StatusCode::NOT_FOUND => return Ok(None),
            _ => {}
        }

        match self.fetch_manifest(reference).await {
            Ok((_, _, digest)) => Ok(Some(digest)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Fetches a manifest by tag or digest, returning its raw bytes, media
    /// type, and digest.
    pub async fn fetch_manifest(
        &self,
        reference: &str,
    ) -> RegistryImageResult<(Bytes, String, String)> {
        let url = self.repo_url(&format!("manifests/{}", reference));
        let response = self
            .request(Method::GET, &url)
            .header(ACCEPT, MANIFEST_ACCEPT_HEADER)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let media_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|header| header.to_str().ok())
                    .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
                    .unwrap_or_else(|| DOCKER_MANIFEST_MIME_TYPE.to_string());
                let digest = header_digest(&response);
                let bytes = response.bytes().await?;
                let digest = digest.unwrap_or_else(|| sha256_digest(&bytes));
                Ok((bytes, media_type, digest))
            }
            StatusCode::NOT_FOUND => Err(RegistryImageError::ManifestNotFound(format!(
                "{}/{}:{}",
                self.registry, self.repository, reference
            ))),
            _ => Err(self.response_error("fetch manifest", response).await),
        }
    }

    /// Fetches a whole blob into memory, verifying its digest. Used for
    /// configurations and other small blobs.
    pub async fn fetch_blob(&self, digest: &str) -> RegistryImageResult<Bytes> {
        let url = self.repo_url(&format!("blobs/{}", digest));
        let response = self.request(Method::GET, &url).send().await?;

        if !response.status().is_success() {
            return Err(self.response_error("fetch blob", response).await);
        }

        let bytes = response.bytes().await?;
        let actual = sha256_digest(&bytes);
        if digest.starts_with("sha256:") && actual != digest {
            return Err(RegistryImageError::DigestMismatch {
                context: format!("{}/{}", self.repository, digest),
                expected: digest.to_string(),
                actual,
            });
        }

        Ok(bytes)
    }

    /// Streams a blob from the registry. This method returns a stream for
    /// efficient processing of large layers.
    pub async fn stream_blob(
        &self,
        digest: &str,
    ) -> RegistryImageResult<BoxStream<'static, RegistryImageResult<Bytes>>> {
        tracing::debug!("streaming blob: {}/{} {}", self.registry, self.repository, digest);

        let url = self.repo_url(&format!("blobs/{}", digest));
        let response = self.request(Method::GET, &url).send().await?;

        if !response.status().is_success() {
            return Err(self.response_error("stream blob", response).await);
        }

        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(Into::into));

        Ok(stream.boxed())
    }

    /// Fetches the platform image a reference resolves to.
    ///
    /// When the reference names an index, the manifest matching the requested
    /// platform is selected; attestation entries are never selected.
    pub async fn fetch_image(
        &self,
        reference: &str,
        os: &str,
        architecture: &str,
    ) -> RegistryImageResult<ImageArtifact> {
        let (raw, media_type, _) = self.fetch_manifest(reference).await?;

        if is_index_media_type(&media_type) {
            let index: ImageIndex = serde_json::from_slice(&raw)?;
            let descriptor = select_platform(&index, os, architecture)?;
            let child_reference = descriptor.digest().to_string();
            let (raw_child, child_media_type, _) = self.fetch_manifest(&child_reference).await?;
            self.artifact_from_manifest(raw_child, child_media_type).await
        } else {
            self.artifact_from_manifest(raw, media_type).await
        }
    }

    /// Fetches the entire index a reference resolves to, or wraps a single
    /// legacy image so consumers can treat both shapes uniformly.
    pub async fn fetch_index_or_image(
        &self,
        reference: &str,
    ) -> RegistryImageResult<ImageIndexOrImage> {
        let (raw, media_type, digest) = self.fetch_manifest(reference).await?;

        if !is_index_media_type(&media_type) {
            let image = self.artifact_from_manifest(raw, media_type).await?;
            return Ok(ImageIndexOrImage::LegacyImage(image));
        }

        let index: ImageIndex = serde_json::from_slice(&raw)?;
        let mut images = Vec::new();
        for descriptor in index.manifests() {
            if is_attestation(descriptor) {
                continue;
            }
            let child_reference = descriptor.digest().to_string();
            let (raw_child, child_media_type, _) = self.fetch_manifest(&child_reference).await?;
            images.push(self.artifact_from_manifest(raw_child, child_media_type).await?);
        }

        Ok(ImageIndexOrImage::Index {
            index,
            raw_index: raw,
            digest,
            media_type,
            images,
        })
    }

    /// Whether a blob is already present in the repository.
    pub async fn blob_exists(&self, digest: &str) -> RegistryImageResult<bool> {
        let url = self.repo_url(&format!("blobs/{}", digest));
        let response = self.request(Method::HEAD, &url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.response_error("check blob", response).await),
        }
    }

    /// Uploads an in-memory blob with a monolithic upload.
    pub async fn upload_blob_bytes(&self, digest: &str, bytes: Bytes) -> RegistryImageResult<()> {
        let location = self.start_blob_upload().await?;
        let response = self
            .request(Method::PUT, &upload_url(&location, digest))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.response_error("upload blob", response).await);
        }
        Ok(())
    }

    /// Uploads a file-backed blob with a monolithic upload, streaming the body.
    pub async fn upload_blob_file(
        &self,
        digest: &str,
        path: impl AsRef<Path>,
    ) -> RegistryImageResult<()> {
        let location = self.start_blob_upload().await?;
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

        let response = self
            .request(Method::PUT, &upload_url(&location, digest))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.response_error("upload blob", response).await);
        }
        Ok(())
    }

    /// Puts a manifest under a tag or digest reference, returning the digest
    /// the registry recorded for it.
    pub async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        bytes: Bytes,
    ) -> RegistryImageResult<String> {
        tracing::info!(
            "pushing manifest {}/{}:{}",
            self.registry,
            self.repository,
            reference
        );

        let url = self.repo_url(&format!("manifests/{}", reference));
        let digest = sha256_digest(&bytes);
        let response = self
            .request(Method::PUT, &url)
            .header(CONTENT_TYPE, media_type)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.response_error("put manifest", response).await);
        }

        Ok(header_digest(&response).unwrap_or(digest))
    }

    /// Pushes an image (or index) under every given tag, uploading each blob
    /// at most once. All tags point at identical content afterwards.
    pub async fn multi_write(
        &self,
        tags: &[String],
        artifact: &ImageIndexOrImage,
        blobs: &dyn BlobSource,
    ) -> RegistryImageResult<String> {
        let mut visited: HashSet<String> = HashSet::new();

        for image in artifact.images() {
            let config_digest = image.get_manifest().config().digest().to_string();
            if visited.insert(config_digest.clone()) && !self.blob_exists(&config_digest).await? {
                self.upload_blob_bytes(&config_digest, image.get_raw_config().clone())
                    .await?;
            }

            for layer in image.get_manifest().layers() {
                let digest = layer.digest().to_string();
                if !visited.insert(digest.clone()) {
                    continue;
                }
                if self.blob_exists(&digest).await? {
                    continue;
                }
                let path = blobs.blob_path(&digest).ok_or_else(|| {
                    RegistryImageError::ImageLoad(format!("missing layer blob {}", digest))
                })?;
                self.upload_blob_file(&digest, &path).await?;
            }
        }

        // Child manifests of an index are addressed by digest before any tag
        // becomes visible.
        if let ImageIndexOrImage::Index { images, .. } = artifact {
            for image in images {
                self.put_manifest(
                    image.get_digest(),
                    image.get_media_type(),
                    image.get_raw_manifest().clone(),
                )
                .await?;
            }
        }

        for tag in tags {
            self.put_manifest(tag, artifact.media_type(), artifact.raw().clone())
                .await?;
        }

        Ok(artifact.digest().to_string())
    }

    /// Parses a manifest and fetches its configuration blob.
    async fn artifact_from_manifest(
        &self,
        raw_manifest: Bytes,
        media_type: String,
    ) -> RegistryImageResult<ImageArtifact> {
        let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&raw_manifest)?;
        let config_digest = manifest.config().digest().to_string();
        let raw_config = self.fetch_blob(&config_digest).await?;
        ImageArtifact::from_raw(raw_manifest, media_type, raw_config)
    }

    fn repo_url(&self, rest: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}",
            self.scheme, self.registry, self.repository, rest
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(header) = &self.auth_header {
            builder = builder.header(AUTHORIZATION, header);
        }
        builder
    }

    async fn start_blob_upload(&self) -> RegistryImageResult<String> {
        let response = self
            .request(Method::POST, &self.repo_url("blobs/uploads/"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.response_error("start blob upload", response).await);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| RegistryImageError::RegistryResponse {
                status: response.status().as_u16(),
                context: format!("start blob upload {}/{}", self.registry, self.repository),
                body: "upload accepted without a Location header".to_string(),
            })?;

        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(location.to_string())
        } else {
            Ok(format!(
                "{}://{}{}",
                self.scheme,
                self.registry,
                location
            ))
        }
    }

    async fn response_error(&self, operation: &str, response: Response) -> RegistryImageError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        RegistryImageError::RegistryResponse {
            status,
            context: format!("{} {}/{}", operation, self.registry, self.repository),
            body,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Selects the index entry matching the requested platform.
///
/// First preference is a full OS and architecture match; failing that, an
/// architecture-only match. Attestation entries never match.
fn select_platform<'a>(
    index: &'a ImageIndex,
    os: &str,
    architecture: &str,
) -> RegistryImageResult<&'a Descriptor> {
    index
        .manifests()
        .iter()
        .find(|descriptor| {
            descriptor.platform().as_ref().is_some_and(|platform| {
                platform.os().to_string() == os
                    && platform.architecture().to_string() == architecture
            }) && !is_attestation(descriptor)
        })
        .or_else(|| {
            index.manifests().iter().find(|descriptor| {
                descriptor.platform().as_ref().is_some_and(|platform| {
                    platform.architecture().to_string() == architecture
                }) && !is_attestation(descriptor)
            })
        })
        .ok_or_else(|| RegistryImageError::NoMatchingPlatform {
            os: os.to_string(),
            architecture: architecture.to_string(),
        })
}

/// Fetches a bearer token from the realm named by the registry's challenge.
async fn fetch_bearer_token(
    client: &ClientWithMiddleware,
    challenge: &AuthChallenge,
    repository: &str,
    scope: AuthScope,
    credential: &RegistryCredential,
) -> RegistryImageResult<String> {
    let realm = challenge
        .params
        .get("realm")
        .ok_or_else(|| RegistryImageError::auth("token service", "challenge without a realm"))?;

    let mut request = client
        .get(realm)
        .query(&[("scope", scope.repository_scope(repository))]);
    if let Some(service) = challenge.params.get("service") {
        request = request.query(&[("service", service.as_str())]);
    }
    if let RegistryCredential::Basic { username, password } = credential {
        request = request.basic_auth(username, Some(password));
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RegistryImageError::auth(
            "token service",
            format!("{} returned {}: {}", realm, status, body),
        ));
    }

    let token: RegistryToken = response.json().await?;
    token
        .bearer()
        .map(|token| format!("Bearer {}", token))
        .ok_or_else(|| RegistryImageError::auth("token service", "response carried no token"))
}

fn basic_header(credential: &RegistryCredential) -> Option<String> {
    match credential {
        RegistryCredential::Anonymous => None,
        RegistryCredential::Basic { username, password } => Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password))
        )),
    }
}

fn header_digest(response: &Response) -> Option<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|header| header.to_str().ok())
        .map(str::to_string)
}

fn upload_url(location: &str, digest: &str) -> String {
    if location.contains('?') {
        format!("{}&digest={}", location, digest)
    } else {
        format!("{}?digest={}", location, digest)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
