//! Writing fetched images to the destination directory and loading local
//! images for pushes.

mod layout;
mod rootfs;
mod tarball;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use oci_spec::image::ImageConfiguration;
use serde::Serialize;
use tempfile::TempDir;

use crate::{
    registry::{BlobSource, ImageIndexOrImage},
    RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use layout::*;
pub use rootfs::*;
pub use tarball::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An image loaded from the local filesystem, ready to push.
///
/// Layer blobs stay on disk and are served by path; manifests and
/// configurations travel as raw bytes inside the artifact.
#[derive(Debug)]
pub struct LoadedImage {
    /// The loaded index or image.
    artifact: ImageIndexOrImage,

    /// Layer digest to on-disk blob location.
    blob_paths: HashMap<String, PathBuf>,

    /// Keeps the unpacked tarball alive for as long as the blobs are needed.
    _staging: Option<TempDir>,
}

/// The shape of the `metadata.json` file written next to a fetched rootfs.
#[derive(Debug, Serialize)]
struct ImageMetadata {
    env: Vec<String>,
    user: String,
    entrypoint: Vec<String>,
    cmd: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LoadedImage {
    /// Assembles a loaded image.
    pub fn new(
        artifact: ImageIndexOrImage,
        blob_paths: HashMap<String, PathBuf>,
        staging: Option<TempDir>,
    ) -> Self {
        Self {
            artifact,
            blob_paths,
            _staging: staging,
        }
    }

    /// The loaded index or image.
    pub fn artifact(&self) -> &ImageIndexOrImage {
        &self.artifact
    }

    /// Ties the lifetime of an unpacked staging directory to this image.
    pub fn hold_staging(mut self, staging: TempDir) -> Self {
        self._staging = Some(staging);
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl BlobSource for LoadedImage {
    fn blob_path(&self, digest: &str) -> Option<PathBuf> {
        self.blob_paths.get(digest).cloned()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes the `tag`, `digest`, and `repository` files every fetch produces.
pub async fn write_aux_files(
    dest: &Path,
    repository: &str,
    tag: &str,
    digest: &str,
) -> RegistryImageResult<()> {
    tokio::fs::create_dir_all(dest).await?;
    tokio::fs::write(dest.join("repository"), repository).await?;
    tokio::fs::write(dest.join("tag"), tag).await?;
    tokio::fs::write(dest.join("digest"), digest).await?;
    Ok(())
}

/// Writes `metadata.json` and `labels.json` from the image configuration.
pub async fn write_config_files(
    dest: &Path,
    config: &ImageConfiguration,
) -> RegistryImageResult<()> {
    let runtime = config.config().as_ref();

    let metadata = ImageMetadata {
        env: runtime
            .and_then(|c| c.env().clone())
            .unwrap_or_default(),
        user: runtime
            .and_then(|c| c.user().clone())
            .unwrap_or_default(),
        entrypoint: runtime
            .and_then(|c| c.entrypoint().clone())
            .unwrap_or_default(),
        cmd: runtime.and_then(|c| c.cmd().clone()).unwrap_or_default(),
    };
    tokio::fs::write(
        dest.join("metadata.json"),
        serde_json::to_vec(&metadata)?,
    )
    .await?;

    let labels: HashMap<String, String> = runtime
        .and_then(|c| c.labels().clone())
        .unwrap_or_default();
    tokio::fs::write(dest.join("labels.json"), serde_json::to_vec(&labels)?).await?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_aux_files_carry_bare_values() -> anyhow::Result<()> {
        let dest = tempdir()?;
        write_aux_files(
            dest.path(),
            "library/busybox",
            "latest",
            "sha256:abc",
        )
        .await?;

        assert_eq!(
            tokio::fs::read_to_string(dest.path().join("repository")).await?,
            "library/busybox"
        );
        assert_eq!(
            tokio::fs::read_to_string(dest.path().join("tag")).await?,
            "latest"
        );
        assert_eq!(
            tokio::fs::read_to_string(dest.path().join("digest")).await?,
            "sha256:abc"
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_config_files_default_to_empty() -> anyhow::Result<()> {
        let dest = tempdir()?;
        let config: ImageConfiguration = serde_json::from_value(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []},
            "history": []
        }))?;

        write_config_files(dest.path(), &config).await?;

        let labels: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(dest.path().join("labels.json")).await?)?;
        assert_eq!(labels, serde_json::json!({}));

        let metadata: serde_json::Value = serde_json::from_str(
            &tokio::fs::read_to_string(dest.path().join("metadata.json")).await?,
        )?;
        assert_eq!(metadata["env"], serde_json::json!([]));
        assert_eq!(metadata["user"], serde_json::json!(""));

        Ok(())
    }
}
