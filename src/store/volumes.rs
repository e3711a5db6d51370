//! Content-addressed store of unpacked layer volumes.
//!
//! A volume is a directory keyed by its layer chain ID. Writers stage
//! under `volumes/.tmp/<uuid>` and publish atomically by rename, so a
//! partially unpacked layer is never visible through `path`/`exists`.
//! Concurrent creators for the same chain ID serialize on a per-chain
//! mutex; losers observe the winner's finished volume.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::StoreLayout;

/// Errors from volume store operations.
#[derive(Debug, Error)]
pub enum VolumeStoreError {
    #[error("volume `{0}` not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An in-progress unpack. Owns its staging directory until `commit`
/// transfers it to the store; dropping an uncommitted writer removes
/// the staging directory.
pub struct VolumeWriter {
    chain_id: String,
    staging_path: PathBuf,
    committed: bool,
    _serialization: OwnedMutexGuard<()>,
}

impl VolumeWriter {
    /// Directory the layer must be unpacked into.
    pub fn directory(&self) -> &Path {
        &self.staging_path
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }
}

impl Drop for VolumeWriter {
    fn drop(&mut self) {
        if !self.committed {
            debug!(
                chain_id = %self.chain_id,
                path = %self.staging_path.display(),
                "discarding uncommitted volume"
            );
            let _ = fs::remove_dir_all(&self.staging_path);
        }
    }
}

/// Content-addressed volume store over a store layout.
pub struct VolumeStore {
    layout: StoreLayout,
    /// Per-chain-ID creation locks so only one unpack body runs.
    chain_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VolumeStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            chain_locks: Mutex::new(HashMap::new()),
        }
    }

    fn volume_path(&self, chain_id: &str) -> PathBuf {
        self.layout.volumes_dir().join(chain_id)
    }

    /// Whether a committed volume exists for `chain_id`.
    pub fn exists(&self, chain_id: &str) -> bool {
        self.volume_path(chain_id).exists()
    }

    /// Start an unpack for `chain_id`. Blocks while another writer for
    /// the same chain ID is in flight; callers must re-check `exists`
    /// on the returned writer's chain before unpacking, since the
    /// previous holder may have committed.
    pub async fn create(&self, chain_id: &str) -> Result<VolumeWriter, VolumeStoreError> {
        let serialization = self.chain_lock(chain_id).await.lock_owned().await;

        let staging_path = self.layout.volumes_tmp_dir().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging_path)?;

        debug!(
            chain_id = %chain_id,
            path = %staging_path.display(),
            "staging volume"
        );

        Ok(VolumeWriter {
            chain_id: chain_id.to_string(),
            staging_path,
            committed: false,
            _serialization: serialization,
        })
    }

    /// Publish a finished unpack under its chain ID.
    pub fn commit(&self, mut writer: VolumeWriter) -> Result<PathBuf, VolumeStoreError> {
        let final_path = self.volume_path(&writer.chain_id);

        if final_path.exists() {
            // Another creator won; adopt its volume. The writer's
            // staging directory is removed on drop.
            return Ok(final_path);
        }

        fs::rename(&writer.staging_path, &final_path)?;
        writer.committed = true;

        info!(
            chain_id = %writer.chain_id,
            path = %final_path.display(),
            "volume committed"
        );

        Ok(final_path)
    }

    /// Path of a committed volume.
    pub fn path(&self, chain_id: &str) -> Result<PathBuf, VolumeStoreError> {
        let path = self.volume_path(chain_id);
        if !path.exists() {
            return Err(VolumeStoreError::NotFound(chain_id.to_string()));
        }
        Ok(path)
    }

    /// Chain IDs of all committed volumes.
    pub fn list(&self) -> Result<Vec<String>, VolumeStoreError> {
        let mut chain_ids = Vec::new();
        for entry in fs::read_dir(self.layout.volumes_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ".tmp" {
                continue;
            }
            chain_ids.push(name);
        }
        chain_ids.sort();
        Ok(chain_ids)
    }

    /// Remove a committed volume. Callers must hold the global lock and
    /// have verified no holder references the chain ID.
    pub fn delete(&self, chain_id: &str) -> Result<(), VolumeStoreError> {
        let path = self.volume_path(chain_id);
        if !path.exists() {
            return Err(VolumeStoreError::NotFound(chain_id.to_string()));
        }
        fs::remove_dir_all(&path)?;
        info!(chain_id = %chain_id, "volume deleted");
        Ok(())
    }

    async fn chain_lock(&self, chain_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.chain_locks.lock().await;
        locks
            .entry(chain_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
