//! Model Availability - presence probe and download metadata

use std::path::{Path, PathBuf};

use crate::config::Config;
use super::registry::{resolve_source, DEFAULT_MODEL_FILE, PRIMARY_SOURCE};
use super::types::{DownloadDescriptor, DownloadSource, ModelDescriptor};

/// Checks the configured model artifact on disk and describes where to get it
#[derive(Debug, Clone)]
pub struct ModelAvailability {
    model_path: PathBuf,
    model_dir: PathBuf,
    model_name: String,
    expected_size: u64,
    sources: Vec<DownloadSource>,
}

impl ModelAvailability {
    pub fn new(config: &Config) -> Self {
        let model_path = config.model_path.clone();
        let model_dir = match model_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let model_name = model_path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_MODEL_FILE.to_string());

        Self {
            model_path,
            model_dir,
            model_name,
            expected_size: config.expected_size,
            sources: config.download_sources.clone(),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn directory(&self) -> &Path {
        &self.model_dir
    }

    /// Size of the artifact if it is present as a regular file.
    ///
    /// Absence is an expected outcome, never an error.
    pub async fn size(&self) -> Option<u64> {
        match tokio::fs::metadata(&self.model_path).await {
            Ok(metadata) if metadata.is_file() => Some(metadata.len()),
            Ok(_) => {
                log::warn!("Model path {:?} exists but is not a file", self.model_path);
                None
            }
            Err(_) => None,
        }
    }

    pub async fn exists(&self) -> bool {
        self.size().await.is_some()
    }

    /// Stat the configured path and describe the artifact
    pub async fn check(&self) -> ModelDescriptor {
        let size = self.size().await;
        log::debug!(
            "Model check {:?}: {}",
            self.model_path,
            match size {
                Some(bytes) => format!("{} bytes", bytes),
                None => "missing".to_string(),
            }
        );

        ModelDescriptor {
            exists: size.is_some(),
            path: self.model_path.clone(),
            directory: self.model_dir.clone(),
            size,
            expected_size: self.expected_size,
            model_name: self.model_name.clone(),
            sources: self.sources.clone(),
        }
    }

    /// Create the model directory (recursively). Returns false on failure.
    pub async fn ensure_storage_location(&self) -> bool {
        match tokio::fs::create_dir_all(&self.model_dir).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to create model directory {:?}: {}", self.model_dir, e);
                false
            }
        }
    }

    /// Download metadata for a named source. Unknown or absent names resolve
    /// to the first-listed (primary) source.
    pub fn describe_download(&self, source: Option<&str>) -> DownloadDescriptor {
        let (name, url) = match resolve_source(&self.sources, source) {
            Some(s) => (s.name.clone(), s.url.clone()),
            None => (PRIMARY_SOURCE.to_string(), String::new()),
        };

        if let Some(requested) = source {
            if requested != name {
                log::warn!("Unknown download source '{}', using '{}'", requested, name);
            }
        }

        DownloadDescriptor {
            source: name,
            url,
            destination: self.model_path.clone(),
            directory: self.model_dir.clone(),
            model_name: self.model_name.clone(),
        }
    }
}
