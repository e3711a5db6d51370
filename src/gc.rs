//! Garbage collection of unreferenced volumes.
//!
//! A volume is live while any holder's dependency set names its chain
//! ID. The sweep runs under the global lock, so volumes being unpacked
//! or registered by an in-flight create are never candidates.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::image::image_ref;
use crate::locksmith::{LockError, Locksmith, GLOBAL_LOCK_KEY};
use crate::store::{DependencyError, DependencyManager, VolumeStore, VolumeStoreError};

/// Errors from a collection run. Individual volume deletions that fail
/// are logged, not surfaced.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Store(#[from] VolumeStoreError),
}

/// Reclaims volumes no holder references.
pub struct GarbageCollector {
    store: Arc<VolumeStore>,
    dependency_manager: Arc<dyn DependencyManager>,
    locksmith: Arc<dyn Locksmith>,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<VolumeStore>,
        dependency_manager: Arc<dyn DependencyManager>,
        locksmith: Arc<dyn Locksmith>,
    ) -> Self {
        Self {
            store,
            dependency_manager,
            locksmith,
        }
    }

    /// Delete every volume whose chain ID no holder references.
    /// `keep_images` additionally pins the chains of the named images.
    pub async fn collect(&self, keep_images: &[Url]) -> Result<(), CollectError> {
        let lock = self.locksmith.lock(GLOBAL_LOCK_KEY)?;
        let result = self.collect_locked(keep_images).await;
        self.locksmith.unlock(lock);

        result
    }

    async fn collect_locked(&self, keep_images: &[Url]) -> Result<(), CollectError> {
        let mut live: HashSet<String> = self
            .dependency_manager
            .all()
            .await?
            .into_values()
            .flatten()
            .collect();

        for image_url in keep_images {
            let holder = format!("image:{}", image_ref(image_url));
            match self.dependency_manager.dependencies(&holder).await {
                Ok(chain_ids) => live.extend(chain_ids),
                Err(DependencyError::NotFound(_)) => {
                    debug!(holder = %holder, "keep-image has no registered chains");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut reclaimed = 0usize;
        for chain_id in self.store.list()? {
            if live.contains(&chain_id) {
                continue;
            }

            match self.store.delete(&chain_id) {
                Ok(()) => reclaimed += 1,
                Err(err) => {
                    warn!(
                        chain_id = %chain_id,
                        error = %err,
                        "failed to delete volume, continuing sweep"
                    );
                }
            }
        }

        info!(reclaimed = reclaimed, live = live.len(), "collection finished");
        Ok(())
    }
}
