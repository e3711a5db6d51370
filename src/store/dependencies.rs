//! Persistent map from holder keys to the chain IDs they keep live.
//!
//! Holder keys take the forms `bundle:<id>` and `image:<ref>`. Each
//! holder is one JSON record under `dependencies/`, filed under the
//! digest of its key; the key itself is stored inside the record, which
//! is what `all` reads back.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Errors from dependency bookkeeping.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("no dependencies registered for `{0}`")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Associations between holders and chain IDs. Mutations must run under
/// the global lock.
#[async_trait]
pub trait DependencyManager: Send + Sync {
    /// Record the association, replacing any prior record for `holder`.
    async fn register(&self, holder: &str, chain_ids: &[String]) -> Result<(), DependencyError>;

    /// Drop the association. Unknown holders are not an error.
    async fn deregister(&self, holder: &str) -> Result<(), DependencyError>;

    /// Chain IDs held live by `holder`.
    async fn dependencies(&self, holder: &str) -> Result<Vec<String>, DependencyError>;

    /// Every holder with its chain ID set.
    async fn all(&self) -> Result<HashMap<String, Vec<String>>, DependencyError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct DependencyRecord {
    holder: String,
    chain_ids: Vec<String>,
}

/// Dependency records as JSON files in a single directory.
pub struct DependencyStore {
    dir: PathBuf,
}

impl DependencyStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, holder: &str) -> PathBuf {
        // Holder keys legally contain `_`, `:`, and `/` (repo and tag
        // segments), so character substitution is not collision-free;
        // the digest of the key is.
        let digest = hex::encode(Sha256::digest(holder.as_bytes()));
        self.dir.join(format!("{digest}.json"))
    }
}

#[async_trait]
impl DependencyManager for DependencyStore {
    async fn register(&self, holder: &str, chain_ids: &[String]) -> Result<(), DependencyError> {
        fs::create_dir_all(&self.dir)?;

        let record = DependencyRecord {
            holder: holder.to_string(),
            chain_ids: chain_ids.to_vec(),
        };
        fs::write(
            self.record_path(holder),
            serde_json::to_string_pretty(&record)?,
        )?;

        debug!(holder = %holder, chain_ids = ?chain_ids, "dependencies registered");
        Ok(())
    }

    async fn deregister(&self, holder: &str) -> Result<(), DependencyError> {
        match fs::remove_file(self.record_path(holder)) {
            Ok(()) => {
                debug!(holder = %holder, "dependencies deregistered");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn dependencies(&self, holder: &str) -> Result<Vec<String>, DependencyError> {
        let path = self.record_path(holder);
        if !path.exists() {
            return Err(DependencyError::NotFound(holder.to_string()));
        }

        let record: DependencyRecord = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(record.chain_ids)
    }

    async fn all(&self) -> Result<HashMap<String, Vec<String>>, DependencyError> {
        let mut holders = HashMap::new();
        if !self.dir.exists() {
            return Ok(holders);
        }

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let record: DependencyRecord =
                serde_json::from_str(&fs::read_to_string(entry.path())?)?;
            holders.insert(record.holder, record.chain_ids);
        }

        Ok(holders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chain_ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let store = DependencyStore::new(tmp.path().join("dependencies"));

        store
            .register("bundle:my-bundle", &chain_ids(&["sha256:a", "sha256:b"]))
            .await
            .unwrap();

        assert_eq!(
            store.dependencies("bundle:my-bundle").await.unwrap(),
            chain_ids(&["sha256:a", "sha256:b"])
        );
    }

    #[tokio::test]
    async fn test_register_overwrites_previous_record() {
        let tmp = TempDir::new().unwrap();
        let store = DependencyStore::new(tmp.path().join("dependencies"));

        store
            .register("bundle:my-bundle", &chain_ids(&["sha256:a"]))
            .await
            .unwrap();
        store
            .register("bundle:my-bundle", &chain_ids(&["sha256:c"]))
            .await
            .unwrap();

        assert_eq!(
            store.dependencies("bundle:my-bundle").await.unwrap(),
            chain_ids(&["sha256:c"])
        );
    }

    #[tokio::test]
    async fn test_dependencies_for_unknown_holder() {
        let tmp = TempDir::new().unwrap();
        let store = DependencyStore::new(tmp.path().join("dependencies"));

        assert!(matches!(
            store.dependencies("bundle:nope").await,
            Err(DependencyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister_is_lenient() {
        let tmp = TempDir::new().unwrap();
        let store = DependencyStore::new(tmp.path().join("dependencies"));

        store
            .register("bundle:my-bundle", &chain_ids(&["sha256:a"]))
            .await
            .unwrap();
        store.deregister("bundle:my-bundle").await.unwrap();
        store.deregister("bundle:my-bundle").await.unwrap();

        assert!(store.dependencies("bundle:my-bundle").await.is_err());
    }

    #[tokio::test]
    async fn test_holders_differing_only_in_separators_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let store = DependencyStore::new(tmp.path().join("dependencies"));

        // `image:myapp_v1` and `image:myapp:v1` must map to distinct
        // records.
        store
            .register("image:myapp_v1", &chain_ids(&["sha256:a"]))
            .await
            .unwrap();
        store
            .register("image:myapp:v1", &chain_ids(&["sha256:b"]))
            .await
            .unwrap();

        assert_eq!(
            store.dependencies("image:myapp_v1").await.unwrap(),
            chain_ids(&["sha256:a"])
        );
        assert_eq!(
            store.dependencies("image:myapp:v1").await.unwrap(),
            chain_ids(&["sha256:b"])
        );

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_all_preserves_holder_keys() {
        let tmp = TempDir::new().unwrap();
        let store = DependencyStore::new(tmp.path().join("dependencies"));

        store
            .register("bundle:my-bundle", &chain_ids(&["sha256:a"]))
            .await
            .unwrap();
        store
            .register("image:ubuntu:latest", &chain_ids(&["sha256:a", "sha256:b"]))
            .await
            .unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["bundle:my-bundle"], chain_ids(&["sha256:a"]));
        assert_eq!(
            all["image:ubuntu:latest"],
            chain_ids(&["sha256:a", "sha256:b"])
        );
    }

    #[tokio::test]
    async fn test_all_on_missing_directory_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = DependencyStore::new(tmp.path().join("nonexistent"));
        assert!(store.all().await.unwrap().is_empty());
    }
}
