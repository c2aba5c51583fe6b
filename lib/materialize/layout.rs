use std::{collections::HashMap, path::Path, str::FromStr};

use bytes::Bytes;
use futures::StreamExt;
use oci_spec::image::{
    Digest, DescriptorBuilder, ImageIndex, ImageIndexBuilder, MediaType, PlatformBuilder,
};
use tokio::io::AsyncWriteExt;

use crate::{
    materialize::LoadedImage,
    registry::{
        is_attestation, sha256_digest, ImageArtifact, ImageIndexOrImage, RegistryClient,
        ORIGINAL_IMAGE_DIGEST_ANNOTATION, SINGLE_IMAGE_DIGEST_FILENAME,
    },
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The layout marker file every OCI layout directory carries.
const OCI_LAYOUT_FILE: &str = "oci-layout";

/// The contents of the layout marker file.
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion": "1.0.0"}"#;

const INDEX_JSON: &str = "index.json";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes a standards-conforming OCI layout for the fetched value.
///
/// A true index lands as served: its raw bytes become `index.json` and every
/// referenced manifest, configuration, and layer becomes a blob. A legacy
/// image is wrapped in a synthetic index carrying the original image digest as
/// an annotation, and the same digest is recorded in the
/// `single-image-digest` marker file so a later push can tell the wrapper
/// apart from a published index.
pub async fn write_layout(
    client: &RegistryClient,
    artifact: &ImageIndexOrImage,
    layout_dir: &Path,
) -> RegistryImageResult<()> {
    tokio::fs::create_dir_all(layout_dir).await?;
    tokio::fs::write(layout_dir.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT).await?;

    match artifact {
        ImageIndexOrImage::Index {
            raw_index, images, ..
        } => {
            tokio::fs::write(layout_dir.join(INDEX_JSON), raw_index).await?;
            for image in images {
                write_image_blobs(client, image, layout_dir).await?;
            }
        }
        ImageIndexOrImage::LegacyImage(image) => {
            let index = synthetic_index(image)?;
            let raw_index = serde_json::to_vec(&index)?;
            tokio::fs::write(layout_dir.join(INDEX_JSON), raw_index).await?;
            tokio::fs::write(
                layout_dir.join(SINGLE_IMAGE_DIGEST_FILENAME),
                image.get_digest(),
            )
            .await?;
            write_image_blobs(client, image, layout_dir).await?;
        }
    }

    Ok(())
}

/// Reads an OCI layout directory back into a pushable image.
///
/// The `single-image-digest` marker distinguishes a synthetic wrapper (pushed
/// as the single image it wraps) from a true index (pushed as an index).
pub async fn read_layout(layout_dir: &Path) -> RegistryImageResult<LoadedImage> {
    let raw_index = Bytes::from(tokio::fs::read(layout_dir.join(INDEX_JSON)).await.map_err(
        |error| {
            RegistryImageError::ImageLoad(format!(
                "{} has no {}: {}",
                layout_dir.display(),
                INDEX_JSON,
                error
            ))
        },
    )?);
    let index: ImageIndex = serde_json::from_slice(&raw_index)?;

    let marker = tokio::fs::read_to_string(layout_dir.join(SINGLE_IMAGE_DIGEST_FILENAME))
        .await
        .ok()
        .map(|digest| digest.trim().to_string());

    let artifact = if let Some(image_digest) = marker {
        let image = read_image_from_blobs(layout_dir, &image_digest, &index).await?;
        ImageIndexOrImage::LegacyImage(image)
    } else {
        let mut images = Vec::new();
        for descriptor in index.manifests() {
            if is_attestation(descriptor) {
                continue;
            }
            let digest = descriptor.digest().to_string();
            let image = read_image_from_blobs(layout_dir, &digest, &index).await?;
            images.push(image);
        }

        ImageIndexOrImage::Index {
            digest: sha256_digest(&raw_index),
            media_type: index
                .media_type()
                .as_ref()
                .map(MediaType::to_string)
                .unwrap_or_else(|| crate::registry::OCI_INDEX_MIME_TYPE.to_string()),
            index,
            raw_index,
            images,
        }
    };

    let blob_paths = blob_path_map(layout_dir, &artifact);
    Ok(LoadedImage::new(artifact, blob_paths, None))
}

/// Streams one image's configuration and layers into the blob store, and
/// records its manifest as a blob as well.
async fn write_image_blobs(
    client: &RegistryClient,
    image: &ImageArtifact,
    layout_dir: &Path,
) -> RegistryImageResult<()> {
    write_blob_bytes(layout_dir, image.get_digest(), image.get_raw_manifest()).await?;

    let config_digest = image.get_manifest().config().digest().to_string();
    write_blob_bytes(layout_dir, &config_digest, image.get_raw_config()).await?;

    for layer in image.get_manifest().layers() {
        let digest = layer.digest().to_string();
        let path = blob_path(layout_dir, &digest)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut stream = client.stream_blob(&digest).await?;
        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
    }

    Ok(())
}

/// Reads one image (manifest + config) from the layout's blob store.
async fn read_image_from_blobs(
    layout_dir: &Path,
    manifest_digest: &str,
    index: &ImageIndex,
) -> RegistryImageResult<ImageArtifact> {
    let raw_manifest = Bytes::from(
        tokio::fs::read(blob_path(layout_dir, manifest_digest)?)
            .await
            .map_err(|error| {
                RegistryImageError::ImageLoad(format!(
                    "missing manifest blob {}: {}",
                    manifest_digest, error
                ))
            })?,
    );

    let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&raw_manifest)?;
    let config_digest = manifest.config().digest().to_string();
    let raw_config = Bytes::from(
        tokio::fs::read(blob_path(layout_dir, &config_digest)?)
            .await
            .map_err(|error| {
                RegistryImageError::ImageLoad(format!(
                    "missing config blob {}: {}",
                    config_digest, error
                ))
            })?,
    );

    let media_type = index
        .manifests()
        .iter()
        .find(|descriptor| descriptor.digest().to_string() == manifest_digest)
        .map(|descriptor| descriptor.media_type().to_string())
        .unwrap_or_else(|| crate::registry::OCI_MANIFEST_MIME_TYPE.to_string());

    ImageArtifact::from_raw(raw_manifest, media_type, raw_config)
}

/// Builds the synthetic index wrapping a legacy image.
fn synthetic_index(image: &ImageArtifact) -> RegistryImageResult<ImageIndex> {
    let platform = PlatformBuilder::default()
        .os(image.get_config().os().clone())
        .architecture(image.get_config().architecture().clone())
        .build()?;

    let descriptor = DescriptorBuilder::default()
        .media_type(image.get_media_type().as_str())
        .digest(Digest::from_str(image.get_digest()).map_err(|error| {
            RegistryImageError::ImageLoad(format!(
                "invalid manifest digest {}: {}",
                image.get_digest(),
                error
            ))
        })?)
        .size(image.get_raw_manifest().len() as u64)
        .platform(platform)
        .build()?;

    let annotations: HashMap<String, String> = [(
        ORIGINAL_IMAGE_DIGEST_ANNOTATION.to_string(),
        image.get_digest().to_string(),
    )]
    .into();

    Ok(ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![descriptor])
        .annotations(annotations)
        .build()?)
}

/// The blob store path of a digest inside a layout directory.
fn blob_path(layout_dir: &Path, digest: &str) -> RegistryImageResult<std::path::PathBuf> {
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| {
        RegistryImageError::ImageLoad(format!("malformed digest: {}", digest))
    })?;
    Ok(layout_dir.join("blobs").join(algorithm).join(hex))
}

/// Maps every layer digest of the artifact to its blob store path.
fn blob_path_map(
    layout_dir: &Path,
    artifact: &ImageIndexOrImage,
) -> HashMap<String, std::path::PathBuf> {
    let mut paths = HashMap::new();
    for image in artifact.images() {
        for layer in image.get_manifest().layers() {
            let digest = layer.digest().to_string();
            if let Ok(path) = blob_path(layout_dir, &digest) {
                paths.insert(digest, path);
            }
        }
    }
    paths
}

async fn write_blob_bytes(
    layout_dir: &Path,
    digest: &str,
    bytes: &Bytes,
) -> RegistryImageResult<()> {
    let path = blob_path(layout_dir, digest)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, bytes).await?;
    Ok(())
}
