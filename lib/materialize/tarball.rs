use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use bytes::Bytes;
use oci_spec::image::{Digest, DescriptorBuilder, ImageManifestBuilder, MediaType};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    materialize::{read_layout, write_layout, LoadedImage},
    registry::{
        sha256_digest, ImageArtifact, ImageIndexOrImage, RegistryClient, OCI_MANIFEST_MIME_TYPE,
    },
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One entry of the docker-compatible `manifest.json` inside an image tarball.
#[derive(Debug, Serialize, Deserialize)]
struct DockerManifestEntry {
    /// Path of the configuration file within the tarball.
    #[serde(rename = "Config")]
    config: String,

    /// The repo:tag names the image was saved under.
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,

    /// Paths of the layer files within the tarball, in manifest order.
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes the fetched image as `image.tar`.
///
/// The tarball holds an OCI layout (so it round-trips through
/// [`load_image`]) plus a docker-compatible `manifest.json` naming the
/// original repo:tag, never the mirror's.
pub async fn write_image_tarball(
    client: &RegistryClient,
    image: &ImageArtifact,
    repo_tag: &str,
    dest_file: &Path,
) -> RegistryImageResult<()> {
    let staging = tempfile::tempdir()?;
    let artifact = ImageIndexOrImage::LegacyImage(image.clone());
    write_layout(client, &artifact, staging.path()).await?;

    let entry = DockerManifestEntry {
        config: blob_relative_path(&image.get_manifest().config().digest().to_string())?,
        repo_tags: vec![repo_tag.to_string()],
        layers: image
            .get_manifest()
            .layers()
            .iter()
            .map(|layer| blob_relative_path(&layer.digest().to_string()))
            .collect::<RegistryImageResult<Vec<_>>>()?,
    };
    tokio::fs::write(
        staging.path().join("manifest.json"),
        serde_json::to_vec(&vec![entry])?,
    )
    .await?;

    let src = staging.path().to_path_buf();
    let dest = dest_file.to_path_buf();
    tokio::task::spawn_blocking(move || -> RegistryImageResult<()> {
        let file = std::fs::File::create(&dest)?;
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all("", &src)?;
        builder.finish()?;
        Ok(())
    })
    .await??;

    Ok(())
}

/// Loads an image for pushing from a tarball or an OCI layout directory.
///
/// Accepted shapes: a tarball produced by [`write_image_tarball`], a
/// docker-save tarball carrying only `manifest.json`, or an OCI layout
/// directory as written by the `oci-layout` format.
pub async fn load_image(path: &Path) -> RegistryImageResult<LoadedImage> {
    if path.is_dir() {
        return read_layout(path).await;
    }

    let staging = tempfile::tempdir()?;
    let tar_path = path.to_path_buf();
    let unpack_dir = staging.path().to_path_buf();
    tokio::task::spawn_blocking(move || -> RegistryImageResult<()> {
        let file = std::fs::File::open(&tar_path)?;
        let mut archive = tar::Archive::new(file);
        archive.unpack(&unpack_dir)?;
        Ok(())
    })
    .await??;

    let loaded = if staging.path().join("index.json").is_file() {
        read_layout(staging.path()).await?
    } else if staging.path().join("manifest.json").is_file() {
        load_docker_save(staging.path()).await?
    } else {
        return Err(RegistryImageError::ImageLoad(format!(
            "{} is not an image tarball",
            path.display()
        )));
    };

    Ok(loaded.hold_staging(staging))
}

/// Loads a docker-save tarball, synthesizing an OCI manifest from its
/// `manifest.json` entry.
async fn load_docker_save(dir: &Path) -> RegistryImageResult<LoadedImage> {
    let raw_entries = tokio::fs::read(dir.join("manifest.json")).await?;
    let entries: Vec<DockerManifestEntry> = serde_json::from_slice(&raw_entries)?;
    let entry = entries
        .first()
        .ok_or_else(|| RegistryImageError::ImageLoad("empty manifest.json".to_string()))?;

    let raw_config = Bytes::from(tokio::fs::read(dir.join(&entry.config)).await.map_err(
        |error| {
            RegistryImageError::ImageLoad(format!(
                "missing config file {}: {}",
                entry.config, error
            ))
        },
    )?);
    let config_digest = sha256_digest(&raw_config);

    let mut layer_descriptors = Vec::new();
    let mut blob_paths: HashMap<String, PathBuf> = HashMap::new();
    for layer in &entry.layers {
        let layer_path = dir.join(layer);
        let (digest, size) = hash_file(layer_path.clone()).await?;

        let media_type = if layer.ends_with(".gz") || layer.ends_with("gzip") {
            MediaType::ImageLayerGzip
        } else {
            MediaType::ImageLayer
        };

        layer_descriptors.push(
            DescriptorBuilder::default()
                .media_type(media_type)
                .digest(parse_digest(&digest)?)
                .size(size)
                .build()?,
        );
        blob_paths.insert(digest, layer_path);
    }

    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(parse_digest(&config_digest)?)
        .size(raw_config.len() as u64)
        .build()?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(layer_descriptors)
        .build()?;
    let raw_manifest = Bytes::from(serde_json::to_vec(&manifest)?);

    let artifact = ImageArtifact::from_raw(raw_manifest, OCI_MANIFEST_MIME_TYPE, raw_config)?;
    Ok(LoadedImage::new(
        ImageIndexOrImage::LegacyImage(artifact),
        blob_paths,
        None,
    ))
}

/// Hashes a file's contents, returning its digest and size.
async fn hash_file(path: PathBuf) -> RegistryImageResult<(String, u64)> {
    tokio::task::spawn_blocking(move || -> RegistryImageResult<(String, u64)> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let size = std::io::copy(&mut file, &mut hasher)?;
        Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
    })
    .await?
}

fn blob_relative_path(digest: &str) -> RegistryImageResult<String> {
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| {
        RegistryImageError::ImageLoad(format!("malformed digest: {}", digest))
    })?;
    Ok(format!("blobs/{}/{}", algorithm, hex))
}

fn parse_digest(digest: &str) -> RegistryImageResult<Digest> {
    Digest::from_str(digest)
        .map_err(|error| RegistryImageError::ImageLoad(format!("invalid digest {}: {}", digest, error)))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::registry::BlobSource;

    use super::*;

    const CONFIG_JSON: &str = r#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]},"config":{"Env":["PATH=/usr/bin"],"Cmd":["/bin/sh"]},"history":[]}"#;

    #[test_log::test(tokio::test)]
    async fn test_load_docker_save_tarball() -> anyhow::Result<()> {
        let dir = tempdir()?;

        // Assemble a minimal docker-save tree and tar it up.
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("deadbeef"))?;
        std::fs::write(tree.join("config.json"), CONFIG_JSON)?;

        let layer_bytes = {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "hello.txt", &b"hello"[..])?;
            builder.into_inner()?
        };
        std::fs::write(tree.join("deadbeef/layer.tar"), &layer_bytes)?;

        let manifest = serde_json::json!([{
            "Config": "config.json",
            "RepoTags": ["example:latest"],
            "Layers": ["deadbeef/layer.tar"]
        }]);
        std::fs::write(tree.join("manifest.json"), serde_json::to_vec(&manifest)?)?;

        let tarball_path = dir.path().join("image.tar");
        let file = std::fs::File::create(&tarball_path)?;
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all("", &tree)?;
        builder.finish()?;
        drop(builder);

        let loaded = load_image(&tarball_path).await?;
        let artifact = loaded.artifact();
        assert!(!artifact.is_index());

        let image = &artifact.images()[0];
        assert_eq!(image.get_manifest().layers().len(), 1);

        let layer_digest = image.get_manifest().layers()[0].digest().to_string();
        assert_eq!(layer_digest, sha256_digest(&layer_bytes));
        assert!(loaded.blob_path(&layer_digest).is_some());

        let config_digest = image.get_manifest().config().digest().to_string();
        assert_eq!(config_digest, sha256_digest(CONFIG_JSON.as_bytes()));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_load_image_rejects_unknown_shapes() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("not-an-image.tar");

        let file = std::fs::File::create(&path)?;
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "junk", &b"junk"[..])?;
        builder.finish()?;
        drop(builder);

        let result = load_image(&path).await;
        assert!(matches!(result, Err(RegistryImageError::ImageLoad(_))));

        Ok(())
    }
}
