//! Registry source: manifests, configs, and gzipped layer blobs over
//! the distribution API.
//!
//! TLS verification is skipped only for registries on the trusted
//! list. Transport failures are classified from the typed reqwest error
//! rather than by matching message substrings.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use reqwest::{header, Client};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use super::oci::{
    ImageConfig, Manifest, SchemaV1Manifest, SchemaV2Manifest, V1Compatibility,
    DOCKER_V2_SCHEMA1_MEDIA_TYPE, DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE,
    DOCKER_V2_SCHEMA2_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE,
};
use super::FetchError;

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.v1+prettyjws, \
     application/vnd.docker.distribution.manifest.v1+json";

/// Source backed by a container registry.
pub struct RemoteSource {
    trusted_registries: Vec<String>,
}

impl RemoteSource {
    pub fn new(trusted_registries: Vec<String>) -> Self {
        Self { trusted_registries }
    }

    /// Fetch and normalize the manifest, dispatching on the response
    /// media type.
    pub async fn manifest(&self, image_url: &Url) -> Result<Manifest, FetchError> {
        let registry = self.registry(image_url);
        let (repository, reference) = repository_and_reference(image_url);

        debug!(
            registry = %registry,
            repository = %repository,
            reference = %reference,
            "fetching manifest"
        );

        let response = self
            .client(image_url)?
            .get(format!(
                "https://{registry}/v2/{repository}/manifests/{reference}"
            ))
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(FetchError::NotFoundOrUnauthorized(format!(
                "fetching manifest: status code {}",
                response.status().as_u16()
            )));
        }

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        let body = response.bytes().await?;
        normalize_manifest(&media_type, &body)
    }

    /// Fetch the image config the manifest points at.
    pub async fn config(
        &self,
        image_url: &Url,
        manifest: &Manifest,
    ) -> Result<ImageConfig, FetchError> {
        match manifest.schema_version {
            1 => schema_v1_config(manifest),
            2 => {
                debug!(
                    config_digest = %manifest.config_cache_key,
                    "fetching config blob"
                );
                let bytes = self
                    .fetch_blob_bytes(image_url, &manifest.config_cache_key)
                    .await?;
                serde_json::from_slice(&bytes).map_err(FetchError::ConfigParse)
            }
            other => Err(FetchError::UnsupportedSchemaVersion(other)),
        }
    }

    /// Open a layer blob, gunzip it, and hand back the raw tar stream.
    /// The decompressed size is reported as 0.
    pub async fn blob(
        &self,
        image_url: &Url,
        digest: &str,
    ) -> Result<(Box<dyn Read + Send>, u64), FetchError> {
        let bytes = self.fetch_blob_bytes(image_url, digest).await?;

        if bytes.len() < 2 || bytes[..2] != [0x1f, 0x8b] {
            return Err(FetchError::NotGzipped(digest.to_string()));
        }

        info!(digest = %digest, compressed_size = bytes.len(), "streaming blob");
        let reader: Box<dyn Read + Send> = Box::new(GzDecoder::new(Cursor::new(bytes)));
        Ok((reader, 0))
    }

    async fn fetch_blob_bytes(
        &self,
        image_url: &Url,
        digest: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let registry = self.registry(image_url);
        let (repository, _) = repository_and_reference(image_url);

        let response = self
            .client(image_url)?
            .get(format!("https://{registry}/v2/{repository}/blobs/{digest}"))
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(FetchError::NotFoundOrUnauthorized(format!(
                "fetching blob `{digest}`: status code {}",
                response.status().as_u16()
            )));
        }

        let bytes = response.bytes().await?.to_vec();

        if let Some(expected) = digest.strip_prefix("sha256:") {
            let actual = hex::encode(Sha256::digest(&bytes));
            if actual != expected {
                return Err(FetchError::BlobDigestMismatch {
                    expected: digest.to_string(),
                    actual: format!("sha256:{actual}"),
                });
            }
        }

        Ok(bytes)
    }

    /// Registry authority, falling back to the default Docker registry
    /// when the URL has no host.
    fn registry(&self, image_url: &Url) -> String {
        match image_url.host_str() {
            None | Some("") => DEFAULT_REGISTRY.to_string(),
            Some(host) => match image_url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            },
        }
    }

    fn skip_tls_validation(&self, image_url: &Url) -> bool {
        let registry = self.registry(image_url);
        self.trusted_registries.iter().any(|r| *r == registry)
    }

    /// Connections are per-call; trusted registries get a client with
    /// certificate verification disabled.
    fn client(&self, image_url: &Url) -> Result<Client, reqwest::Error> {
        let skip = self.skip_tls_validation(image_url);
        if skip {
            debug!(registry = %self.registry(image_url), "skipping TLS validation");
        }
        Client::builder().danger_accept_invalid_certs(skip).build()
    }
}

/// Map a transport error: certificate failures against registries that
/// are not trusted surface as the insecure-registry error.
fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_connect() {
        let detail = format!("{err:#}");
        let lowered = detail.to_lowercase();
        if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
            return FetchError::InsecureRegistryTls(detail);
        }
    }
    FetchError::Http(err)
}

fn normalize_manifest(media_type: &str, raw: &[u8]) -> Result<Manifest, FetchError> {
    match media_type {
        DOCKER_V2_SCHEMA1_MEDIA_TYPE | DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE => {
            debug!("docker image schema 1");
            parse_schema_v1_manifest(raw)
        }
        OCI_IMAGE_MANIFEST_MEDIA_TYPE | DOCKER_V2_SCHEMA2_MEDIA_TYPE => {
            debug!("docker image schema 2");
            parse_schema_v2_manifest(raw)
        }
        other => Err(FetchError::UnsupportedMediaType(other.to_string())),
    }
}

/// Schema 1 stores layers and history top first; normalize to base
/// first. The config cache key is the digest of the top history entry,
/// which carries the full image config.
fn parse_schema_v1_manifest(raw: &[u8]) -> Result<Manifest, FetchError> {
    let doc: SchemaV1Manifest = serde_json::from_slice(raw).map_err(FetchError::ManifestParse)?;

    let mut layers: Vec<String> = doc.fs_layers.into_iter().map(|l| l.blob_sum).collect();
    layers.reverse();

    let mut v1_compatibility: Vec<String> =
        doc.history.into_iter().map(|h| h.v1_compatibility).collect();
    v1_compatibility.reverse();

    let config_source = v1_compatibility.last().ok_or(FetchError::EmptyV1History)?;
    let config_cache_key = format!(
        "sha256:{}",
        hex::encode(Sha256::digest(config_source.as_bytes()))
    );

    Ok(Manifest {
        schema_version: 1,
        layers,
        config_cache_key,
        v1_compatibility,
    })
}

fn parse_schema_v2_manifest(raw: &[u8]) -> Result<Manifest, FetchError> {
    let doc: SchemaV2Manifest = serde_json::from_slice(raw).map_err(FetchError::ManifestParse)?;

    Ok(Manifest {
        schema_version: 2,
        layers: doc.layers.into_iter().map(|l| l.digest).collect(),
        config_cache_key: doc.config.digest,
        v1_compatibility: Vec::new(),
    })
}

/// Schema 1 has no config blob: the top history entry is the config,
/// and diff IDs are derived from the per-layer `id` fields.
fn schema_v1_config(manifest: &Manifest) -> Result<ImageConfig, FetchError> {
    let raw_config = manifest
        .v1_compatibility
        .last()
        .ok_or(FetchError::EmptyV1History)?;

    let mut config: ImageConfig =
        serde_json::from_str(raw_config).map_err(FetchError::ConfigParse)?;

    for raw_history in &manifest.v1_compatibility {
        let compat: V1Compatibility =
            serde_json::from_str(raw_history).map_err(FetchError::ConfigParse)?;
        config.rootfs.diff_ids.push(format!("sha256:{}", compat.id));
    }

    Ok(config)
}

/// Split an image URL path into repository and tag/digest reference.
/// Single-segment repositories map into the `library/` namespace.
fn repository_and_reference(image_url: &Url) -> (String, String) {
    let path = image_url.path().trim_start_matches('/');

    let (name, reference) = if let Some((name, digest)) = path.rsplit_once('@') {
        (name, digest.to_string())
    } else if let Some((name, tag)) = path.rsplit_once(':') {
        if tag.contains('/') {
            (path, "latest".to_string())
        } else {
            (name, tag.to_string())
        }
    } else {
        (path, "latest".to_string())
    };

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    };

    (repository, reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_repository_and_reference_library_image() {
        let (repo, reference) = repository_and_reference(&url("docker:///ubuntu:latest"));
        assert_eq!(repo, "library/ubuntu");
        assert_eq!(reference, "latest");
    }

    #[test]
    fn test_repository_and_reference_defaults_to_latest() {
        let (repo, reference) = repository_and_reference(&url("docker:///ubuntu"));
        assert_eq!(repo, "library/ubuntu");
        assert_eq!(reference, "latest");
    }

    #[test]
    fn test_repository_and_reference_nested_repository() {
        let (repo, reference) =
            repository_and_reference(&url("docker://registry.example.com/org/app:v1"));
        assert_eq!(repo, "org/app");
        assert_eq!(reference, "v1");
    }

    #[test]
    fn test_repository_and_reference_digest() {
        let (repo, reference) = repository_and_reference(&url("docker:///alpine@sha256:abc123"));
        assert_eq!(repo, "library/alpine");
        assert_eq!(reference, "sha256:abc123");
    }

    #[test]
    fn test_registry_defaults_when_host_empty() {
        let source = RemoteSource::new(vec![]);
        assert_eq!(source.registry(&url("docker:///ubuntu")), DEFAULT_REGISTRY);
        assert_eq!(
            source.registry(&url("docker://localhost:5000/app")),
            "localhost:5000"
        );
    }

    #[test]
    fn test_skip_tls_validation_matches_authority() {
        let source = RemoteSource::new(vec!["localhost:5000".to_string()]);
        assert!(source.skip_tls_validation(&url("docker://localhost:5000/app")));
        assert!(!source.skip_tls_validation(&url("docker://registry.example.com/app")));
    }

    #[test]
    fn test_normalize_schema_v1_reverses_layers_and_history() {
        let raw = br#"{
            "schemaVersion": 1,
            "fsLayers": [
                {"blobSum": "sha256:top"},
                {"blobSum": "sha256:mid"},
                {"blobSum": "sha256:base"}
            ],
            "history": [
                {"v1Compatibility": "{\"id\":\"top\"}"},
                {"v1Compatibility": "{\"id\":\"mid\"}"},
                {"v1Compatibility": "{\"id\":\"base\"}"}
            ]
        }"#;

        let manifest = normalize_manifest(DOCKER_V2_SCHEMA1_MEDIA_TYPE, raw).unwrap();
        assert_eq!(manifest.schema_version, 1);
        assert_eq!(
            manifest.layers,
            vec!["sha256:base", "sha256:mid", "sha256:top"]
        );
        assert_eq!(
            manifest.v1_compatibility,
            vec!["{\"id\":\"base\"}", "{\"id\":\"mid\"}", "{\"id\":\"top\"}"]
        );

        let expected_key = format!(
            "sha256:{}",
            hex::encode(Sha256::digest("{\"id\":\"top\"}".as_bytes()))
        );
        assert_eq!(manifest.config_cache_key, expected_key);
    }

    #[test]
    fn test_normalize_schema_v2() {
        let raw = br#"{
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:cfg", "size": 2},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:base", "size": 2},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:top", "size": 2}
            ]
        }"#;

        let manifest = normalize_manifest(DOCKER_V2_SCHEMA2_MEDIA_TYPE, raw).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.layers, vec!["sha256:base", "sha256:top"]);
        assert_eq!(manifest.config_cache_key, "sha256:cfg");
        assert!(manifest.v1_compatibility.is_empty());
    }

    #[test]
    fn test_normalize_rejects_unknown_media_type() {
        let err = normalize_manifest("application/json", b"{}").unwrap_err();
        assert!(err.to_string().contains("unknown media type 'application/json'"));
    }

    #[test]
    fn test_schema_v1_config_collects_diff_ids() {
        let manifest = Manifest {
            schema_version: 1,
            layers: vec!["sha256:base-blob".into(), "sha256:top-blob".into()],
            config_cache_key: "sha256:whatever".into(),
            v1_compatibility: vec![
                "{\"id\":\"base\"}".into(),
                "{\"id\":\"top\",\"author\":\"someone\"}".into(),
            ],
        };

        let config = schema_v1_config(&manifest).unwrap();
        assert_eq!(config.author.as_deref(), Some("someone"));
        assert_eq!(config.rootfs.diff_ids, vec!["sha256:base", "sha256:top"]);
    }

    #[test]
    fn test_schema_v1_config_requires_history() {
        let manifest = Manifest {
            schema_version: 1,
            ..Default::default()
        };
        assert!(matches!(
            schema_v1_config(&manifest),
            Err(FetchError::EmptyV1History)
        ));
    }
}
