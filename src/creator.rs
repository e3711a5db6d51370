//! The creation pipeline.
//!
//! `create` composes the bundler, image puller, locksmith, and
//! dependency manager into one transactional sequence: validate,
//! pre-check uniqueness, lock, pull, assemble, register, unlock. Any
//! failure after the bundle exists destroys it before surfacing.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::bundler::{Bundle, BundleError, BundleSpec, Bundler};
use crate::image::{
    image_ref, parse_image_url, ImagePuller, ImageSpec, ImageUrlError, PullError,
};
use crate::locksmith::{LockError, Locksmith, GLOBAL_LOCK_KEY};
use crate::mappings::{validate_mappings, IdMapping, MappingError};
use crate::store::{DependencyError, DependencyManager};

/// A request to create a bundle.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// Unique across active bundles.
    pub id: String,
    /// `docker://` URL or absolute directory path.
    pub image: String,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    /// Bytes; 0 means unlimited.
    pub disk_limit: u64,
}

/// Errors from the creation pipeline.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("id was not specified")]
    MissingId,

    #[error(transparent)]
    InvalidMappings(#[from] MappingError),

    #[error(transparent)]
    ImageUrl(#[from] ImageUrlError),

    #[error("bundle for id `{0}` already exists")]
    AlreadyExists(String),

    /// Failure while checking uniqueness; surfaced as-is.
    #[error(transparent)]
    Bundler(BundleError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Pull(#[from] PullError),

    #[error("making bundle: {0}")]
    MakingBundle(#[source] BundleError),

    #[error(transparent)]
    DependencyRegistration(#[from] DependencyError),
}

/// End-to-end bundle creation over pluggable collaborators.
pub struct Creator {
    bundler: Arc<dyn Bundler>,
    image_puller: Arc<dyn ImagePuller>,
    locksmith: Arc<dyn Locksmith>,
    dependency_manager: Arc<dyn DependencyManager>,
}

impl Creator {
    pub fn new(
        bundler: Arc<dyn Bundler>,
        image_puller: Arc<dyn ImagePuller>,
        locksmith: Arc<dyn Locksmith>,
        dependency_manager: Arc<dyn DependencyManager>,
    ) -> Self {
        Self {
            bundler,
            image_puller,
            locksmith,
            dependency_manager,
        }
    }

    pub async fn create(&self, spec: CreateSpec) -> Result<Bundle, CreateError> {
        if spec.id.is_empty() {
            return Err(CreateError::MissingId);
        }
        validate_mappings(&spec.uid_mappings)?;
        validate_mappings(&spec.gid_mappings)?;

        let image_url = parse_image_url(&spec.image)?;

        // Optimistic pre-check; re-checked under the lock by the
        // bundler's create.
        if self
            .bundler
            .exists(&spec.id)
            .await
            .map_err(CreateError::Bundler)?
        {
            return Err(CreateError::AlreadyExists(spec.id));
        }

        let lock = self.locksmith.lock(GLOBAL_LOCK_KEY)?;
        let result = self.create_locked(&spec, &image_url).await;
        self.locksmith.unlock(lock);

        if let Ok(bundle) = &result {
            info!(id = %bundle.id, path = %bundle.path.display(), "bundle created");
        }
        result
    }

    async fn create_locked(
        &self,
        spec: &CreateSpec,
        image_url: &Url,
    ) -> Result<Bundle, CreateError> {
        let image = self
            .image_puller
            .pull(&ImageSpec {
                image_src: image_url.clone(),
                uid_mappings: spec.uid_mappings.clone(),
                gid_mappings: spec.gid_mappings.clone(),
            })
            .await?;

        let bundle = self
            .bundler
            .create(&BundleSpec {
                id: spec.id.clone(),
                volume_path: image.volume_path.clone(),
                image: image.config.clone(),
                uid_mappings: spec.uid_mappings.clone(),
                gid_mappings: spec.gid_mappings.clone(),
                disk_limit: spec.disk_limit,
            })
            .await
            .map_err(CreateError::MakingBundle)?;

        if let Err(err) = self
            .register_dependencies(&spec.id, image_url, &image.chain_ids)
            .await
        {
            error!(
                id = %spec.id,
                error = %err,
                "registering dependencies failed, destroying bundle"
            );
            if let Err(destroy_err) = self.bundler.destroy(&spec.id).await {
                warn!(
                    id = %spec.id,
                    error = %destroy_err,
                    "destroying bundle after failed registration"
                );
            }
            return Err(err.into());
        }

        Ok(bundle)
    }

    async fn register_dependencies(
        &self,
        id: &str,
        image_url: &Url,
        chain_ids: &[String],
    ) -> Result<(), DependencyError> {
        self.dependency_manager
            .register(&format!("bundle:{id}"), chain_ids)
            .await?;

        if image_url.scheme() == "docker" {
            self.dependency_manager
                .register(&format!("image:{}", image_ref(image_url)), chain_ids)
                .await?;
        }

        Ok(())
    }
}
