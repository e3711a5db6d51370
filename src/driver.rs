//! Volume driver seam: layer unpacking and writable-view management.
//!
//! The overlayfs/newuidmap driver lives outside the core; [`CopyDriver`]
//! is the portable implementation. It materializes writable views by
//! cloning the volume tree, which keeps bundles isolated from each
//! other and from the immutable volumes without privileges.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{lchown, symlink};
use std::path::{Path, PathBuf};

use tar::Archive;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mappings::{translate_owner, IdMapping};

/// Errors from unpacking layers or managing writable views.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("changing ownership of `{path}`: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Filesystem operations the store delegates to a driver.
pub trait VolumeDriver: Send + Sync {
    /// Extract a raw tar stream into `dest`, translating file owners
    /// through the mappings.
    fn unpack(
        &self,
        tar_stream: &mut dyn Read,
        dest: &Path,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> Result<(), DriverError>;

    /// Materialize a writable view of `volume_path` at `rootfs_path`.
    /// The disk limit is forwarded for drivers that can enforce it.
    fn snapshot(
        &self,
        volume_path: &Path,
        rootfs_path: &Path,
        disk_limit: u64,
    ) -> Result<(), DriverError>;

    /// Remove a writable view, tolerating partial creation.
    fn destroy(&self, rootfs_path: &Path) -> Result<(), DriverError>;
}

/// Driver that clones trees instead of mounting overlays.
pub struct CopyDriver;

impl VolumeDriver for CopyDriver {
    fn unpack(
        &self,
        tar_stream: &mut dyn Read,
        dest: &Path,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> Result<(), DriverError> {
        fs::create_dir_all(dest)?;

        let mut archive = Archive::new(tar_stream);
        archive.set_preserve_permissions(true);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();

            // Absolute entries would make `dest.join` discard the
            // destination entirely; parent components could climb out.
            if path.is_absolute()
                || path
                    .components()
                    .any(|c| c == std::path::Component::ParentDir)
            {
                warn!(path = %path.display(), "skipping tar entry escaping the destination");
                continue;
            }

            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            if file_name == ".wh..opq" {
                apply_opaque_whiteout(dest, &path)?;
                continue;
            }
            if let Some(target_name) = file_name.strip_prefix(".wh.") {
                apply_whiteout(dest, &path, target_name);
                continue;
            }

            let full_path = dest.join(&path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let uid = translate_owner(uid_mappings, entry.header().uid()? as u32);
            let gid = translate_owner(gid_mappings, entry.header().gid()? as u32);

            entry.unpack(&full_path)?;

            // Without mappings the content runs as the current user and
            // ownership is left as unpacked.
            if !uid_mappings.is_empty() || !gid_mappings.is_empty() {
                lchown(&full_path, Some(uid), Some(gid)).map_err(|source| {
                    DriverError::Chown {
                        path: full_path.clone(),
                        source,
                    }
                })?;
            }
        }

        Ok(())
    }

    fn snapshot(
        &self,
        volume_path: &Path,
        rootfs_path: &Path,
        disk_limit: u64,
    ) -> Result<(), DriverError> {
        debug!(
            volume = %volume_path.display(),
            rootfs = %rootfs_path.display(),
            disk_limit = disk_limit,
            "cloning volume into writable view"
        );
        copy_tree(volume_path, rootfs_path)?;
        Ok(())
    }

    fn destroy(&self, rootfs_path: &Path) -> Result<(), DriverError> {
        match fs::remove_dir_all(rootfs_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// `.wh..opq` marks its directory opaque: everything unpacked from
/// lower layers is dropped.
fn apply_opaque_whiteout(dest: &Path, entry_path: &Path) -> Result<(), DriverError> {
    let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));
    let full_parent = dest.join(parent);

    if full_parent.exists() {
        for child in fs::read_dir(&full_parent)? {
            let child = child?;
            if child.path().is_dir() {
                let _ = fs::remove_dir_all(child.path());
            } else {
                let _ = fs::remove_file(child.path());
            }
        }
    }

    Ok(())
}

/// `.wh.<name>` deletes the sibling `<name>` from lower layers.
fn apply_whiteout(dest: &Path, entry_path: &Path, target_name: &str) {
    let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));
    let target = dest.join(parent).join(target_name);
    let _ = fs::remove_file(&target);
    let _ = fs::remove_dir_all(&target);
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
