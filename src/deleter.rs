//! The deletion pipeline: destroy a bundle and drop its holder record.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::bundler::{BundleError, Bundler};
use crate::locksmith::{LockError, Locksmith, GLOBAL_LOCK_KEY};
use crate::store::{DependencyError, DependencyManager};

/// Errors from deleting a bundle.
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("id was not specified")]
    MissingId,

    #[error("bundle `{0}` not found")]
    NotFound(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Bundler(#[from] BundleError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),
}

/// Destroys bundles under the global lock.
pub struct Deleter {
    bundler: Arc<dyn Bundler>,
    locksmith: Arc<dyn Locksmith>,
    dependency_manager: Arc<dyn DependencyManager>,
}

impl Deleter {
    pub fn new(
        bundler: Arc<dyn Bundler>,
        locksmith: Arc<dyn Locksmith>,
        dependency_manager: Arc<dyn DependencyManager>,
    ) -> Self {
        Self {
            bundler,
            locksmith,
            dependency_manager,
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), DeleteError> {
        if id.is_empty() {
            return Err(DeleteError::MissingId);
        }

        let lock = self.locksmith.lock(GLOBAL_LOCK_KEY)?;
        let result = self.delete_locked(id).await;
        self.locksmith.unlock(lock);

        result
    }

    async fn delete_locked(&self, id: &str) -> Result<(), DeleteError> {
        if !self.bundler.exists(id).await? {
            return Err(DeleteError::NotFound(id.to_string()));
        }

        self.bundler.destroy(id).await?;
        self.dependency_manager
            .deregister(&format!("bundle:{id}"))
            .await?;

        info!(id = %id, "bundle deleted");
        Ok(())
    }
}
