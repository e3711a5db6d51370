//! On-disk store layout.
//!
//! Everything lives under a single root:
//!
//! ```text
//! <store>/
//!   volumes/<chain_id>/     committed, immutable layer content
//!   volumes/.tmp/<uuid>/    in-progress unpacks
//!   bundles/<id>/rootfs/    writable per-bundle views
//!   dependencies/           holder -> chain ID records
//!   locks/                  advisory lock files
//! ```

pub mod dependencies;
pub mod volumes;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

pub use dependencies::{DependencyError, DependencyManager, DependencyStore};
pub use volumes::{VolumeStore, VolumeStoreError, VolumeWriter};

const VOLUMES_DIR: &str = "volumes";
const TMP_DIR: &str = ".tmp";
const BUNDLES_DIR: &str = "bundles";
const DEPENDENCIES_DIR: &str = "dependencies";
const LOCKS_DIR: &str = "locks";

/// Path helpers for a store root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join(VOLUMES_DIR)
    }

    /// Staging area for unpacks that have not been committed yet.
    pub fn volumes_tmp_dir(&self) -> PathBuf {
        self.volumes_dir().join(TMP_DIR)
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join(BUNDLES_DIR)
    }

    pub fn bundle_path(&self, id: &str) -> PathBuf {
        self.bundles_dir().join(id)
    }

    pub fn dependencies_dir(&self) -> PathBuf {
        self.root.join(DEPENDENCIES_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    /// Create the store tree and sweep staging directories abandoned by
    /// writers that never committed (crashed or cancelled runs).
    pub fn init(&self) -> io::Result<()> {
        for dir in [
            self.volumes_dir(),
            self.volumes_tmp_dir(),
            self.bundles_dir(),
            self.dependencies_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }

        for entry in fs::read_dir(self.volumes_tmp_dir())? {
            let entry = entry?;
            warn!(path = %entry.path().display(), "sweeping abandoned volume staging directory");
            if entry.path().is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }

        Ok(())
    }
}
