//! User and group ID mappings for unpacked image content.
//!
//! A mapping `HOST:NAMESPACE:SIZE` translates the IDs
//! `[NAMESPACE, NAMESPACE+SIZE)` seen inside a user namespace to
//! `[HOST, HOST+SIZE)` on the host. File ownership in unpacked layers is
//! rewritten through these mappings so the tree appears to belong to an
//! unprivileged user.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing or validating ID mappings.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("invalid mapping `{0}`: expected HOST:NAMESPACE:SIZE")]
    Malformed(String),

    #[error("invalid mapping `{input}`: `{value}` is not a number")]
    NotANumber { input: String, value: String },

    #[error("invalid mapping `{0}`: size must be greater than zero")]
    ZeroSize(String),

    #[error("overlapping mappings: `{0}` and `{1}`")]
    Overlap(IdMapping, IdMapping),
}

/// A single UID or GID range translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub host_id: u32,
    pub namespace_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// Whether `id` falls inside the namespace range of this mapping.
    pub fn contains(&self, id: u32) -> bool {
        id >= self.namespace_id && id - self.namespace_id < self.size
    }

    /// Translate a namespace ID to its host ID. Callers must check
    /// `contains` first.
    pub fn translate(&self, id: u32) -> u32 {
        self.host_id + (id - self.namespace_id)
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host_id, self.namespace_id, self.size)
    }
}

impl FromStr for IdMapping {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 3 {
            return Err(MappingError::Malformed(s.to_string()));
        }

        let parse = |value: &str| -> Result<u32, MappingError> {
            value.parse().map_err(|_| MappingError::NotANumber {
                input: s.to_string(),
                value: value.to_string(),
            })
        };

        let mapping = IdMapping {
            host_id: parse(fields[0])?,
            namespace_id: parse(fields[1])?,
            size: parse(fields[2])?,
        };

        if mapping.size == 0 {
            return Err(MappingError::ZeroSize(s.to_string()));
        }

        Ok(mapping)
    }
}

/// Reject sequences whose namespace ranges overlap. Overlapping ranges
/// would make owner translation ambiguous.
pub fn validate_mappings(mappings: &[IdMapping]) -> Result<(), MappingError> {
    let mut sorted: Vec<IdMapping> = mappings.to_vec();
    sorted.sort_by_key(|m| m.namespace_id);

    for pair in sorted.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.namespace_id + prev.size > next.namespace_id {
            return Err(MappingError::Overlap(prev, next));
        }
    }

    Ok(())
}

/// Translate a file owner through a mapping sequence. IDs outside every
/// mapped range keep their original value.
pub fn translate_owner(mappings: &[IdMapping], id: u32) -> u32 {
    mappings
        .iter()
        .find(|m| m.contains(id))
        .map(|m| m.translate(id))
        .unwrap_or(id)
}
