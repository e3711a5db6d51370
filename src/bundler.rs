//! Bundle assembly: a writable root filesystem per instance.
//!
//! A bundle is `bundles/<id>/` holding `rootfs/` (the writable view the
//! driver materializes from the image's top volume) and `image.json`
//! bookkeeping. Writes under `rootfs` never reach the volumes it was
//! built from.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::driver::{DriverError, VolumeDriver};
use crate::image::ImageConfig;
use crate::mappings::IdMapping;
use crate::store::StoreLayout;

const ROOTFS_DIR: &str = "rootfs";
const IMAGE_JSON: &str = "image.json";

/// Errors from bundle operations.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle for id `{0}` already exists")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Everything needed to assemble a bundle from a pulled image.
#[derive(Debug, Clone, Default)]
pub struct BundleSpec {
    pub id: String,
    pub volume_path: PathBuf,
    pub image: ImageConfig,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub disk_limit: u64,
}

/// A materialized bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    pub id: String,
    pub path: PathBuf,
    pub rootfs_path: PathBuf,
}

/// Bundle lifecycle operations.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool, BundleError>;
    async fn create(&self, spec: &BundleSpec) -> Result<Bundle, BundleError>;

    /// Remove the bundle, succeeding even when it was only partially
    /// created.
    async fn destroy(&self, id: &str) -> Result<(), BundleError>;
}

/// Bookkeeping written next to the rootfs.
#[derive(Debug, Serialize, Deserialize)]
struct BundleMeta {
    image: ImageConfig,
    disk_limit: u64,
    created_at: String,
}

/// Bundler laying bundles out under the store's `bundles/` directory.
pub struct DirectoryBundler {
    layout: StoreLayout,
    driver: Arc<dyn VolumeDriver>,
}

impl DirectoryBundler {
    pub fn new(layout: StoreLayout, driver: Arc<dyn VolumeDriver>) -> Self {
        Self { layout, driver }
    }
}

#[async_trait]
impl Bundler for DirectoryBundler {
    async fn exists(&self, id: &str) -> Result<bool, BundleError> {
        Ok(self.layout.bundle_path(id).exists())
    }

    async fn create(&self, spec: &BundleSpec) -> Result<Bundle, BundleError> {
        let path = self.layout.bundle_path(&spec.id);

        fs::create_dir_all(self.layout.bundles_dir())?;
        if let Err(err) = fs::create_dir(&path) {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(BundleError::AlreadyExists(spec.id.clone()));
            }
            return Err(err.into());
        }

        let rootfs_path = path.join(ROOTFS_DIR);
        let result = self.assemble(spec, &path, &rootfs_path);

        if let Err(err) = result {
            // Never leave a half-built bundle behind.
            if let Err(cleanup_err) = fs::remove_dir_all(&path) {
                warn!(
                    id = %spec.id,
                    error = %cleanup_err,
                    "failed to clean up partial bundle"
                );
            }
            return Err(err);
        }

        info!(id = %spec.id, path = %path.display(), "bundle created");

        Ok(Bundle {
            id: spec.id.clone(),
            path,
            rootfs_path,
        })
    }

    async fn destroy(&self, id: &str) -> Result<(), BundleError> {
        let path = self.layout.bundle_path(id);

        self.driver.destroy(&path.join(ROOTFS_DIR))?;

        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(id = %id, "bundle destroyed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl DirectoryBundler {
    fn assemble(
        &self,
        spec: &BundleSpec,
        path: &std::path::Path,
        rootfs_path: &std::path::Path,
    ) -> Result<(), BundleError> {
        let meta = BundleMeta {
            image: spec.image.clone(),
            disk_limit: spec.disk_limit,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        fs::write(
            path.join(IMAGE_JSON),
            serde_json::to_string_pretty(&meta)?,
        )?;

        self.driver
            .snapshot(&spec.volume_path, rootfs_path, spec.disk_limit)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CopyDriver;
    use tempfile::TempDir;

    fn bundler(tmp: &TempDir) -> (DirectoryBundler, StoreLayout) {
        let layout = StoreLayout::new(tmp.path().join("store"));
        layout.init().unwrap();
        (
            DirectoryBundler::new(layout.clone(), Arc::new(CopyDriver)),
            layout,
        )
    }

    fn seed_volume(tmp: &TempDir) -> PathBuf {
        let volume = tmp.path().join("volume");
        fs::create_dir_all(&volume).unwrap();
        fs::write(volume.join("foo"), b"hello-world").unwrap();
        volume
    }

    #[tokio::test]
    async fn test_create_lays_out_rootfs_and_bookkeeping() {
        let tmp = TempDir::new().unwrap();
        let (bundler, layout) = bundler(&tmp);
        let volume = seed_volume(&tmp);

        let bundle = bundler
            .create(&BundleSpec {
                id: "some-id".to_string(),
                volume_path: volume,
                disk_limit: 1024,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(bundle.id, "some-id");
        assert_eq!(bundle.path, layout.bundle_path("some-id"));
        assert_eq!(bundle.rootfs_path, bundle.path.join("rootfs"));
        assert_eq!(
            fs::read(bundle.rootfs_path.join("foo")).unwrap(),
            b"hello-world"
        );

        let meta: BundleMeta =
            serde_json::from_str(&fs::read_to_string(bundle.path.join("image.json")).unwrap())
                .unwrap();
        assert_eq!(meta.disk_limit, 1024);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id() {
        let tmp = TempDir::new().unwrap();
        let (bundler, _) = bundler(&tmp);
        let volume = seed_volume(&tmp);

        let spec = BundleSpec {
            id: "some-id".to_string(),
            volume_path: volume,
            ..Default::default()
        };
        bundler.create(&spec).await.unwrap();

        let err = bundler.create(&spec).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("bundle for id `some-id` already exists"));
    }

    #[tokio::test]
    async fn test_create_cleans_up_on_failure() {
        let tmp = TempDir::new().unwrap();
        let (bundler, layout) = bundler(&tmp);

        // Missing volume path makes the snapshot fail.
        let err = bundler
            .create(&BundleSpec {
                id: "some-id".to_string(),
                volume_path: tmp.path().join("missing"),
                ..Default::default()
            })
            .await;

        assert!(err.is_err());
        assert!(!layout.bundle_path("some-id").exists());
    }

    #[tokio::test]
    async fn test_exists_reflects_bundle_directory() {
        let tmp = TempDir::new().unwrap();
        let (bundler, _) = bundler(&tmp);
        let volume = seed_volume(&tmp);

        assert!(!bundler.exists("some-id").await.unwrap());

        bundler
            .create(&BundleSpec {
                id: "some-id".to_string(),
                volume_path: volume,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(bundler.exists("some-id").await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_removes_bundle() {
        let tmp = TempDir::new().unwrap();
        let (bundler, layout) = bundler(&tmp);
        let volume = seed_volume(&tmp);

        bundler
            .create(&BundleSpec {
                id: "some-id".to_string(),
                volume_path: volume,
                ..Default::default()
            })
            .await
            .unwrap();

        bundler.destroy("some-id").await.unwrap();
        assert!(!layout.bundle_path("some-id").exists());
    }

    #[tokio::test]
    async fn test_destroy_tolerates_partial_bundle() {
        let tmp = TempDir::new().unwrap();
        let (bundler, layout) = bundler(&tmp);

        // A directory with no rootfs, as a failed create might leave
        // before cleanup.
        fs::create_dir_all(layout.bundle_path("partial")).unwrap();
        bundler.destroy("partial").await.unwrap();
        assert!(!layout.bundle_path("partial").exists());

        // Destroying an id that never existed is also fine.
        bundler.destroy("never-created").await.unwrap();
    }
}
