//! Local directory source: a directory tree treated as a one-layer
//! image.
//!
//! The layer digest is the sha256 of a canonical (sorted-entry) tar of
//! the tree, so the blob stream and the manifest digest always agree.
//! No network I/O.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use super::oci::{ImageConfig, Manifest, RootFs};
use super::FetchError;

/// Source backed by a directory on the local filesystem.
#[derive(Default)]
pub struct LocalSource;

impl LocalSource {
    pub fn new() -> Self {
        Self
    }

    /// Synthesize a one-layer manifest for the directory.
    pub fn manifest(&self, image_url: &Url) -> Result<Manifest, FetchError> {
        let dir = image_dir(image_url)?;
        let digest = layer_digest(&dir)?;

        debug!(path = %dir.display(), digest = %digest, "local image manifest");

        Ok(Manifest {
            schema_version: 2,
            layers: vec![digest.clone()],
            config_cache_key: digest,
            v1_compatibility: Vec::new(),
        })
    }

    /// Synthesize a config with the layer digest as the sole diff ID
    /// and no history.
    pub fn config(&self, manifest: &Manifest) -> Result<ImageConfig, FetchError> {
        Ok(ImageConfig {
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: manifest.layers.clone(),
            },
            ..Default::default()
        })
    }

    /// The layer blob: the canonical tar of the directory, uncompressed.
    pub fn blob(&self, image_url: &Url) -> Result<(Box<dyn Read + Send>, u64), FetchError> {
        let dir = image_dir(image_url)?;
        let mut buffer = Vec::new();
        canonical_tar(&dir, &mut buffer)?;

        let reader: Box<dyn Read + Send> = Box::new(Cursor::new(buffer));
        Ok((reader, 0))
    }
}

fn image_dir(image_url: &Url) -> Result<PathBuf, FetchError> {
    let path = image_url
        .to_file_path()
        .map_err(|_| FetchError::InvalidPath(image_url.to_string()))?;
    if !path.is_dir() {
        return Err(FetchError::NotADirectory(path.display().to_string()));
    }
    Ok(path)
}

fn layer_digest(dir: &Path) -> Result<String, FetchError> {
    let mut hasher = HashWriter::default();
    canonical_tar(dir, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.hasher.finalize())))
}

/// Serialize the tree as a tar with entries in sorted relative-path
/// order, so the same tree always produces the same bytes.
fn canonical_tar<W: Write>(dir: &Path, out: W) -> io::Result<()> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    let mut entries = Vec::new();
    collect_entries(dir, dir, &mut entries)?;
    entries.sort();

    for relative in entries {
        let absolute = dir.join(&relative);
        let metadata = fs::symlink_metadata(&absolute)?;
        if metadata.is_dir() {
            builder.append_dir(&relative, &absolute)?;
        } else {
            builder.append_path_with_name(&absolute, &relative)?;
        }
    }

    builder.into_inner()?;
    Ok(())
}

fn collect_entries(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
            .to_path_buf();
        out.push(relative);

        if entry.file_type()?.is_dir() {
            collect_entries(root, &path, out)?;
        }
    }
    Ok(())
}

#[derive(Default)]
struct HashWriter {
    hasher: Sha256,
}

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image_url(dir: &Path) -> Url {
        Url::from_file_path(dir).unwrap()
    }

    fn seed_image(tmp: &TempDir) -> PathBuf {
        let dir = tmp.path().join("image");
        fs::create_dir_all(dir.join("etc")).unwrap();
        fs::write(dir.join("foo"), b"hello-world").unwrap();
        fs::write(dir.join("etc/config"), b"key=value").unwrap();
        dir
    }

    #[test]
    fn test_manifest_has_one_layer() {
        let tmp = TempDir::new().unwrap();
        let dir = seed_image(&tmp);
        let source = LocalSource::new();

        let manifest = source.manifest(&image_url(&dir)).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert!(manifest.layers[0].starts_with("sha256:"));
        assert_eq!(manifest.config_cache_key, manifest.layers[0]);
    }

    #[test]
    fn test_digest_is_stable_across_calls() {
        let tmp = TempDir::new().unwrap();
        let dir = seed_image(&tmp);
        let source = LocalSource::new();

        let first = source.manifest(&image_url(&dir)).unwrap();
        let second = source.manifest(&image_url(&dir)).unwrap();
        assert_eq!(first.layers, second.layers);
    }

    #[test]
    fn test_digest_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        let dir = seed_image(&tmp);
        let source = LocalSource::new();

        let before = source.manifest(&image_url(&dir)).unwrap();
        fs::write(dir.join("foo"), b"changed").unwrap();
        let after = source.manifest(&image_url(&dir)).unwrap();
        assert_ne!(before.layers, after.layers);
    }

    #[test]
    fn test_config_uses_layer_digest_as_diff_id() {
        let tmp = TempDir::new().unwrap();
        let dir = seed_image(&tmp);
        let source = LocalSource::new();

        let manifest = source.manifest(&image_url(&dir)).unwrap();
        let config = source.config(&manifest).unwrap();
        assert_eq!(config.rootfs.diff_ids, manifest.layers);
        assert!(config.history.is_empty());
    }

    #[test]
    fn test_blob_is_a_tar_of_the_tree() {
        let tmp = TempDir::new().unwrap();
        let dir = seed_image(&tmp);
        let source = LocalSource::new();

        let (reader, size) = source.blob(&image_url(&dir)).unwrap();
        assert_eq!(size, 0);

        let mut archive = tar::Archive::new(reader);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect();

        assert_eq!(names, vec!["etc", "etc/config", "foo"]);
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let source = LocalSource::new();
        let url = Url::from_file_path(tmp.path().join("nope")).unwrap();

        assert!(matches!(
            source.manifest(&url),
            Err(FetchError::NotADirectory(_))
        ));
    }
}
