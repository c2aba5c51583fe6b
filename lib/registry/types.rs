use std::{collections::HashMap, path::PathBuf};

use bytes::Bytes;
use getset::Getters;
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::RegistryImageResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MIME type of Docker Registry v2 image manifests.
pub const DOCKER_MANIFEST_MIME_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The MIME type of Docker Registry v2 manifest lists.
pub const DOCKER_MANIFEST_LIST_MIME_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// The MIME type of OCI image manifests.
pub const OCI_MANIFEST_MIME_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// The MIME type of OCI image indexes.
pub const OCI_INDEX_MIME_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// The Accept header sent with every manifest request.
pub const MANIFEST_ACCEPT_HEADER: &str = "application/vnd.docker.distribution.manifest.v2+json, application/vnd.docker.distribution.manifest.list.v2+json, application/vnd.oci.image.manifest.v1+json, application/vnd.oci.image.index.v1+json";

/// The annotation key that marks attestation manifests inside an index.
pub const ATTESTATION_ANNOTATION: &str = "vnd.docker.reference.type";

/// The index annotation recording the digest of a legacy image wrapped in a
/// synthetic index.
pub const ORIGINAL_IMAGE_DIGEST_ANNOTATION: &str = "original-image-digest";

/// The marker file written next to an OCI layout produced from a legacy image.
pub const SINGLE_IMAGE_DIGEST_FILENAME: &str = "single-image-digest";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The response of the tags-list endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct TagList {
    /// The repository the tags belong to.
    pub name: Option<String>,

    /// The tag names. Some registries serialize an empty namespace as `null`.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// A token granted by a registry's authorization service.
///
/// Registries disagree on the field name, so both spellings are accepted.
#[derive(Debug, Default, Deserialize)]
pub struct RegistryToken {
    /// The token under its canonical name.
    pub token: Option<String>,

    /// The token under its OAuth2 name.
    pub access_token: Option<String>,
}

/// One fetched or loaded platform image: its manifest and configuration,
/// together with the raw bytes both were parsed from so digests stay stable
/// across a round trip.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageArtifact {
    /// The parsed image manifest.
    manifest: ImageManifest,

    /// The manifest exactly as served, used for pushes and digest computation.
    raw_manifest: Bytes,

    /// The manifest media type.
    media_type: String,

    /// The manifest digest (`algo:hex`).
    digest: String,

    /// The parsed image configuration.
    config: ImageConfiguration,

    /// The configuration blob exactly as served.
    raw_config: Bytes,
}

/// Either a full OCI image index or a single legacy image.
///
/// Modern repositories publish multi-arch indexes; older ones publish a bare
/// image manifest. Consumers that need to tell the two apart after a round
/// trip through the filesystem use the [`SINGLE_IMAGE_DIGEST_FILENAME`]
/// marker written alongside materialized layouts.
#[derive(Debug, Clone)]
pub enum ImageIndexOrImage {
    /// A true image index with its per-platform images.
    Index {
        /// The parsed index.
        index: ImageIndex,

        /// The index exactly as served.
        raw_index: Bytes,

        /// The index digest.
        digest: String,

        /// The index media type.
        media_type: String,

        /// The non-attestation images the index references.
        images: Vec<ImageArtifact>,
    },

    /// A single image that was not wrapped in an index by its publisher.
    LegacyImage(ImageArtifact),
}

/// Access to blob contents by digest, backed by an unpacked tarball or an
/// on-disk OCI layout. Pushes read layer data through this seam.
pub trait BlobSource {
    /// The local path of the blob with the given digest, if present.
    fn blob_path(&self, digest: &str) -> Option<PathBuf>;
}

/// A parsed `Www-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// The challenge scheme (`Bearer` or `Basic`).
    pub scheme: String,

    /// The challenge parameters (realm, service, scope, ...).
    pub params: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryToken {
    /// The usable token value, regardless of which field carried it.
    pub fn bearer(&self) -> Option<&str> {
        self.token
            .as_deref()
            .or(self.access_token.as_deref())
            .filter(|token| !token.is_empty())
    }
}

impl ImageArtifact {
    /// Parses an artifact from raw manifest and configuration bytes.
    pub fn from_raw(
        raw_manifest: Bytes,
        media_type: impl Into<String>,
        raw_config: Bytes,
    ) -> RegistryImageResult<Self> {
        let manifest: ImageManifest = serde_json::from_slice(&raw_manifest)?;
        let config: ImageConfiguration = serde_json::from_slice(&raw_config)?;
        let digest = sha256_digest(&raw_manifest);

        Ok(Self {
            manifest,
            raw_manifest,
            media_type: media_type.into(),
            digest,
            config,
            raw_config,
        })
    }
}

impl ImageIndexOrImage {
    /// The digest of the index, or of the image when there is no index.
    pub fn digest(&self) -> &str {
        match self {
            ImageIndexOrImage::Index { digest, .. } => digest,
            ImageIndexOrImage::LegacyImage(image) => image.get_digest(),
        }
    }

    /// The media type pushed or written for the top-level object.
    pub fn media_type(&self) -> &str {
        match self {
            ImageIndexOrImage::Index { media_type, .. } => media_type,
            ImageIndexOrImage::LegacyImage(image) => image.get_media_type(),
        }
    }

    /// The raw bytes of the top-level object.
    pub fn raw(&self) -> &Bytes {
        match self {
            ImageIndexOrImage::Index { raw_index, .. } => raw_index,
            ImageIndexOrImage::LegacyImage(image) => image.get_raw_manifest(),
        }
    }

    /// Every platform image carried by this value.
    pub fn images(&self) -> &[ImageArtifact] {
        match self {
            ImageIndexOrImage::Index { images, .. } => images,
            ImageIndexOrImage::LegacyImage(image) => std::slice::from_ref(image),
        }
    }

    /// Whether this is a true index rather than a wrapped legacy image.
    pub fn is_index(&self) -> bool {
        matches!(self, ImageIndexOrImage::Index { .. })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the `sha256:hex` digest of a byte slice.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Whether a manifest media type denotes an index rather than a single image.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_INDEX_MIME_TYPE || media_type == DOCKER_MANIFEST_LIST_MIME_TYPE
}

/// Parses a `Www-Authenticate` header into its scheme and quoted parameters.
pub fn parse_www_authenticate(header: &str) -> Option<AuthChallenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ')?;

    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }

    Some(AuthChallenge {
        scheme: scheme.to_string(),
        params,
    })
}

/// Whether an index entry is an attestation rather than a platform image.
pub fn is_attestation(descriptor: &oci_spec::image::Descriptor) -> bool {
    descriptor
        .annotations()
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(ATTESTATION_ANNOTATION))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
