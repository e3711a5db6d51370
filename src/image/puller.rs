//! Pulls an image into the content-addressed volume store.
//!
//! Layers are unpacked base to top; a layer whose chain ID is already
//! committed is skipped, and concurrent pulls of the same chain ID
//! coalesce on the store's per-chain serialization.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::driver::{DriverError, VolumeDriver};
use crate::store::{VolumeStore, VolumeStoreError};

use super::{FetchError, Image, ImageSpec, Source};

/// Errors from pulling an image.
#[derive(Debug, Error)]
pub enum PullError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("image has no layers")]
    EmptyImage,

    #[error("manifest lists {layers} layers but the config has {diff_ids} diff ids")]
    LayerMismatch { layers: usize, diff_ids: usize },

    #[error(transparent)]
    Store(#[from] VolumeStoreError),

    #[error("unpacking layer `{chain_id}`: {source}")]
    Unpack {
        chain_id: String,
        #[source]
        source: DriverError,
    },
}

/// Produces a canonical [`Image`] from an image source.
#[async_trait]
pub trait ImagePuller: Send + Sync {
    async fn pull(&self, spec: &ImageSpec) -> Result<Image, PullError>;
}

/// Puller over the volume store and a volume driver.
pub struct LayerPuller {
    store: Arc<VolumeStore>,
    driver: Arc<dyn VolumeDriver>,
    trusted_registries: Vec<String>,
}

impl LayerPuller {
    pub fn new(
        store: Arc<VolumeStore>,
        driver: Arc<dyn VolumeDriver>,
        trusted_registries: Vec<String>,
    ) -> Self {
        Self {
            store,
            driver,
            trusted_registries,
        }
    }
}

#[async_trait]
impl ImagePuller for LayerPuller {
    async fn pull(&self, spec: &ImageSpec) -> Result<Image, PullError> {
        let source = Source::for_url(&spec.image_src, &self.trusted_registries)?;

        let manifest = source.manifest(&spec.image_src).await?;
        let config = source.config(&spec.image_src, &manifest).await?;

        let chain_ids = chain_ids(&config.rootfs.diff_ids);
        if chain_ids.is_empty() {
            return Err(PullError::EmptyImage);
        }
        if manifest.layers.len() != chain_ids.len() {
            return Err(PullError::LayerMismatch {
                layers: manifest.layers.len(),
                diff_ids: chain_ids.len(),
            });
        }

        info!(
            image = %spec.image_src,
            layer_count = chain_ids.len(),
            "pulling image"
        );

        for (blob_digest, chain_id) in manifest.layers.iter().zip(&chain_ids) {
            if self.store.exists(chain_id) {
                debug!(chain_id = %chain_id, "layer already in store");
                continue;
            }

            let writer = self.store.create(chain_id).await?;
            if self.store.exists(chain_id) {
                // Another pull committed this chain while we waited for
                // the writer; the staging directory is dropped.
                debug!(chain_id = %chain_id, "layer committed concurrently");
                continue;
            }

            let (mut stream, _size) = source.blob(&spec.image_src, blob_digest).await?;
            self.driver
                .unpack(
                    &mut *stream,
                    writer.directory(),
                    &spec.uid_mappings,
                    &spec.gid_mappings,
                )
                .map_err(|source| PullError::Unpack {
                    chain_id: chain_id.clone(),
                    source,
                })?;

            self.store.commit(writer)?;
        }

        let top_chain_id = chain_ids.last().ok_or(PullError::EmptyImage)?;
        let volume_path = self.store.path(top_chain_id)?;

        Ok(Image {
            volume_path,
            chain_ids,
            config,
        })
    }
}

/// Chain IDs from diff IDs, base first: the first chain ID is the first
/// diff ID; each subsequent one hashes `parent_chain + " " + diff_id`
/// over the prefixed digest strings.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut ids = Vec::with_capacity(diff_ids.len());
    let mut parent = String::new();

    for diff_id in diff_ids {
        parent = if parent.is_empty() {
            diff_id.clone()
        } else {
            let digest = Sha256::digest(format!("{parent} {diff_id}").as_bytes());
            format!("sha256:{}", hex::encode(digest))
        };
        ids.push(parent.clone());
    }

    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_ids_of_empty_image() {
        assert!(chain_ids(&[]).is_empty());
    }

    #[test]
    fn test_first_chain_id_is_the_diff_id() {
        let ids = chain_ids(&["sha256:aaa".to_string()]);
        assert_eq!(ids, vec!["sha256:aaa"]);
    }

    #[test]
    fn test_chain_id_recurrence() {
        let ids = chain_ids(&["sha256:aaa".to_string(), "sha256:bbb".to_string()]);

        let expected = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(b"sha256:aaa sha256:bbb"))
        );
        assert_eq!(ids, vec!["sha256:aaa".to_string(), expected]);
    }

    #[test]
    fn test_chain_ids_depend_on_order() {
        let forward = chain_ids(&["sha256:aaa".to_string(), "sha256:bbb".to_string()]);
        let reversed = chain_ids(&["sha256:bbb".to_string(), "sha256:aaa".to_string()]);
        assert_ne!(forward.last(), reversed.last());
    }
}
