use std::{
    ffi::OsStr,
    fs,
    io::{BufReader, Read},
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use futures::StreamExt;
use nix::unistd;
use sha2::{Digest as _, Sha256};
use tar::{Archive, EntryType};
use tokio::io::AsyncWriteExt;

use crate::{
    registry::{ImageArtifact, RegistryClient},
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Filename prefix marking the deletion of the suffixed sibling.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Filename marking the deletion of everything below its directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reconstructs the image's root filesystem at `<dest>/rootfs/`.
///
/// Layers are applied in manifest order, bottom to top. Each layer is staged
/// to a temporary file, verified against its digest, and unpacked on a
/// blocking task in two passes: whiteouts first, then the layer's own entries
/// in tar order. Opaque whiteouts erase the directory contents earlier layers
/// created without touching siblings added by the same layer.
pub async fn extract_rootfs(
    client: &RegistryClient,
    image: &ImageArtifact,
    dest: &Path,
) -> RegistryImageResult<()> {
    let rootfs_dir = dest.join("rootfs");
    tokio::fs::create_dir_all(&rootfs_dir).await?;

    let staging = tempfile::tempdir()?;

    for (index, layer) in image.get_manifest().layers().iter().enumerate() {
        let digest = layer.digest().to_string();
        let media_type = layer.media_type().to_string();
        tracing::info!("applying layer {}: {}", index, digest);

        let layer_path = staging.path().join(digest.replace(':', "-"));
        download_blob_to(client, &digest, &layer_path).await?;

        let root = rootfs_dir.clone();
        tokio::task::spawn_blocking(move || apply_layer(&layer_path, &root, &media_type, &digest))
            .await??;
    }

    Ok(())
}

/// Streams a blob to a file, verifying its digest as it is written.
async fn download_blob_to(
    client: &RegistryClient,
    digest: &str,
    path: &Path,
) -> RegistryImageResult<()> {
    let mut stream = client.stream_blob(digest).await?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        hasher.update(&bytes);
        file.write_all(&bytes).await?;
    }
    file.flush().await?;

    let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
    if digest.starts_with("sha256:") && actual != digest {
        tokio::fs::remove_file(path).await.ok();
        return Err(RegistryImageError::DigestMismatch {
            context: format!("layer {}", digest),
            expected: digest.to_string(),
            actual,
        });
    }

    Ok(())
}

/// Applies one layer file to the rootfs.
fn apply_layer(
    layer_path: &Path,
    root: &Path,
    media_type: &str,
    digest: &str,
) -> RegistryImageResult<()> {
    apply_whiteouts(layer_path, root, media_type, digest)?;
    unpack_entries(layer_path, root, media_type, digest)
}

/// First pass: whiteout files delete what earlier layers created.
fn apply_whiteouts(
    layer_path: &Path,
    root: &Path,
    media_type: &str,
    digest: &str,
) -> RegistryImageResult<()> {
    let mut archive = Archive::new(layer_reader(layer_path, media_type, digest)?);

    for entry in archive.entries().map_err(|e| layer_error(e, digest))? {
        let entry = entry.map_err(|e| layer_error(e, digest))?;
        let entry_path = entry.path().map_err(|e| layer_error(e, digest))?.into_owned();

        let Some(name) = entry_path.file_name().and_then(OsStr::to_str) else {
            continue;
        };

        if name == OPAQUE_WHITEOUT {
            let dir = sanitize_path(root, entry_path.parent().unwrap_or(Path::new("")));
            if dir.is_dir() {
                clear_directory(&dir)?;
            } else {
                fs::create_dir_all(&dir)?;
            }
        } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = entry_path.parent().unwrap_or(Path::new(""));
            let victim = sanitize_path(root, &parent.join(target));
            remove_any(&victim)?;
        }
    }

    Ok(())
}

/// Second pass: unpack the layer's entries in tar order.
fn unpack_entries(
    layer_path: &Path,
    root: &Path,
    media_type: &str,
    digest: &str,
) -> RegistryImageResult<()> {
    let mut archive = Archive::new(layer_reader(layer_path, media_type, digest)?);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    // Ownership from the tar headers only applies when it can succeed.
    archive.set_preserve_ownerships(unistd::geteuid().is_root());

    for entry in archive.entries().map_err(|e| layer_error(e, digest))? {
        let mut entry = entry.map_err(|e| layer_error(e, digest))?;
        let entry_path = entry.path().map_err(|e| layer_error(e, digest))?.into_owned();

        let Some(name) = entry_path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        if name == OPAQUE_WHITEOUT || name.starts_with(WHITEOUT_PREFIX) {
            continue;
        }

        let dest = sanitize_path(root, &entry_path);

        match entry.header().entry_type() {
            // Device nodes cannot be created in a user namespace.
            EntryType::Block | EntryType::Char => {
                tracing::debug!("skipping device node {}", entry_path.display());
                continue;
            }
            EntryType::Link => {
                let Some(link_name) = entry.link_name().map_err(|e| layer_error(e, digest))?
                else {
                    continue;
                };
                let target = sanitize_path(root, &link_name);
                replace_with_non_directory(&dest)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::hard_link(&target, &dest)?;
            }
            EntryType::Directory => {
                replace_with_directory(&dest)?;
                entry.unpack(&dest).map_err(|e| layer_error(e, digest))?;
            }
            _ => {
                replace_with_non_directory(&dest)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest).map_err(|e| layer_error(e, digest))?;
            }
        }
    }

    Ok(())
}

/// Opens a layer file with the decompression its media type calls for.
fn layer_reader(
    path: &Path,
    media_type: &str,
    digest: &str,
) -> RegistryImageResult<Box<dyn Read>> {
    let file = fs::File::open(path).map_err(|e| layer_error(e, digest))?;
    let buffered = BufReader::new(file);

    if media_type.contains("zstd") {
        let decoder = zstd::stream::read::Decoder::new(buffered).map_err(|e| layer_error(e, digest))?;
        Ok(Box::new(decoder))
    } else if media_type.contains("gzip") {
        Ok(Box::new(GzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Joins an archive path onto the rootfs, dropping any component that would
/// escape it.
fn sanitize_path(root: &Path, relative: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// Removes all children of a directory, keeping the directory itself.
fn clear_directory(dir: &Path) -> RegistryImageResult<()> {
    for child in fs::read_dir(dir)? {
        let child = child?;
        remove_any(&child.path())?;
    }
    Ok(())
}

/// Removes a path regardless of its type, tolerating absence.
fn remove_any(path: &Path) -> RegistryImageResult<()> {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

/// Makes room for a non-directory entry at the path.
fn replace_with_non_directory(path: &Path) -> RegistryImageResult<()> {
    remove_any(path)
}

/// Makes room for a directory entry, keeping an existing directory in place.
fn replace_with_directory(path: &Path) -> RegistryImageResult<()> {
    match path.symlink_metadata() {
        Ok(metadata) if !metadata.is_dir() => {
            fs::remove_file(path)?;
        }
        _ => {}
    }
    Ok(())
}

fn layer_error(source: std::io::Error, digest: &str) -> RegistryImageError {
    RegistryImageError::LayerHandling {
        source,
        layer: digest.to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
