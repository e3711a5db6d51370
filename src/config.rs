//! Process-wide configuration.
//!
//! CLI flags take precedence; environment variables fill the gaps so
//! wrappers can configure the tool without rebuilding command lines.

use std::path::PathBuf;

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the store tree.
    pub store: PathBuf,
    /// Registries contacted without TLS verification.
    pub trusted_registries: Vec<String>,
}

impl Config {
    pub fn new(store: PathBuf, insecure_registries: Vec<String>) -> Self {
        let mut trusted_registries = insecure_registries;

        if let Ok(raw) = std::env::var("ROOTSTOCK_TRUSTED_REGISTRIES") {
            trusted_registries.extend(
                raw.split(',')
                    .map(|entry| entry.trim().to_string())
                    .filter(|entry| !entry.is_empty()),
            );
        }

        Self {
            store,
            trusted_registries,
        }
    }
}
