//! Image sources and the pull pipeline.
//!
//! An image reference is either a `docker://` URL (registry source) or
//! an absolute directory path (local source). Both sources expose the
//! same capability set — manifest, config, blob — and the puller drives
//! whichever the URL selects into the content-addressed volume store.

pub mod local;
pub mod oci;
pub mod puller;
pub mod remote;

use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::mappings::IdMapping;

pub use local::LocalSource;
pub use oci::{ImageConfig, Manifest};
pub use puller::{chain_ids, ImagePuller, LayerPuller, PullError};
pub use remote::RemoteSource;

/// Errors turning a raw image reference into a URL.
#[derive(Debug, Error)]
#[error("parsing image url: {0}")]
pub struct ImageUrlError(pub String);

/// Parse an image reference. `docker://` URLs select the registry
/// source; absolute paths select the local source.
pub fn parse_image_url(raw: &str) -> Result<Url, ImageUrlError> {
    let url = if raw.contains("://") {
        Url::parse(raw).map_err(|err| ImageUrlError(err.to_string()))?
    } else if Path::new(raw).is_absolute() {
        Url::from_file_path(raw)
            .map_err(|_| ImageUrlError(format!("`{raw}` is not a valid image path")))?
    } else {
        return Err(ImageUrlError(format!(
            "`{raw}` is neither a URL nor an absolute path"
        )));
    };

    match url.scheme() {
        "docker" | "file" => Ok(url),
        other => Err(ImageUrlError(format!("unsupported scheme `{other}`"))),
    }
}

/// The holder-key reference for a registry image: the last path segment
/// of its URL, tag included.
pub fn image_ref(url: &Url) -> String {
    url.path()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Request for pulling an image into the store.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub image_src: Url,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

/// A pulled image: the top volume plus the identities of its chain.
#[derive(Debug, Clone, Default)]
pub struct Image {
    /// Unpacked directory of the composed top layer, usable as the
    /// lower layer of a writable view.
    pub volume_path: PathBuf,
    /// Layer chain IDs, base first.
    pub chain_ids: Vec<String>,
    pub config: ImageConfig,
}

/// Errors fetching manifests, configs, or blobs from a source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image does not exist or you do not have permissions to see it: {0}")]
    NotFoundOrUnauthorized(String),

    #[error("TLS validation of insecure registry failed: {0}")]
    InsecureRegistryTls(String),

    #[error("unknown media type '{0}'")]
    UnsupportedMediaType(String),

    #[error("schema version not supported ({0})")]
    UnsupportedSchemaVersion(u32),

    #[error("parsing manifest: {0}")]
    ManifestParse(#[source] serde_json::Error),

    #[error("manifest has no v1 compatibility history")]
    EmptyV1History,

    #[error("parsing image config: {0}")]
    ConfigParse(#[source] serde_json::Error),

    #[error("blob digest mismatch: expected {expected}, got {actual}")]
    BlobDigestMismatch { expected: String, actual: String },

    #[error("reading gzip: blob `{0}` is not gzip compressed")]
    NotGzipped(String),

    #[error("image `{0}` is not a directory")]
    NotADirectory(String),

    #[error("invalid local image path `{0}`")]
    InvalidPath(String),

    #[error("unsupported image URL scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of manifests, configs, and layer blobs, selected by the
/// image URL's scheme.
pub enum Source {
    Remote(RemoteSource),
    Local(LocalSource),
}

impl Source {
    pub fn for_url(url: &Url, trusted_registries: &[String]) -> Result<Self, FetchError> {
        match url.scheme() {
            "docker" => Ok(Source::Remote(RemoteSource::new(
                trusted_registries.to_vec(),
            ))),
            "file" => Ok(Source::Local(LocalSource::new())),
            other => Err(FetchError::UnsupportedScheme(other.to_string())),
        }
    }

    pub async fn manifest(&self, image_url: &Url) -> Result<Manifest, FetchError> {
        match self {
            Source::Remote(source) => source.manifest(image_url).await,
            Source::Local(source) => source.manifest(image_url),
        }
    }

    pub async fn config(
        &self,
        image_url: &Url,
        manifest: &Manifest,
    ) -> Result<ImageConfig, FetchError> {
        match self {
            Source::Remote(source) => source.config(image_url, manifest).await,
            Source::Local(source) => source.config(manifest),
        }
    }

    /// Open a layer blob as a raw tar stream. The reported decompressed
    /// size is always 0.
    pub async fn blob(
        &self,
        image_url: &Url,
        digest: &str,
    ) -> Result<(Box<dyn Read + Send>, u64), FetchError> {
        match self {
            Source::Remote(source) => source.blob(image_url, digest).await,
            Source::Local(source) => source.blob(image_url),
        }
    }
}
