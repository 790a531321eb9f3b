//! Model Availability Types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A named place the model artifact can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSource {
    pub name: String,
    pub url: String,
}

/// Snapshot of the on-disk model artifact.
///
/// Recomputed on every check; presence can change between two checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub exists: bool,
    pub path: PathBuf,
    pub directory: PathBuf,
    /// Size in bytes, `None` when the artifact is absent
    pub size: Option<u64>,
    pub expected_size: u64,
    pub model_name: String,
    /// Download sources in priority order
    pub sources: Vec<DownloadSource>,
}

impl ModelDescriptor {
    /// URL of a named download source
    pub fn source_url(&self, name: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.url.as_str())
    }
}

/// Everything a host needs to fetch the model from one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub source: String,
    pub url: String,
    pub destination: PathBuf,
    pub directory: PathBuf,
    pub model_name: String,
}
