//! Model Availability Registry - default artifact and download sources

use super::types::DownloadSource;

/// Filename of the default model artifact
pub const DEFAULT_MODEL_FILE: &str = "openhands-lm-1.5b-v0.1.i1-Q4_0.gguf";

/// Default model location (GPT4All's model directory)
pub const DEFAULT_MODEL_PATH: &str =
    "~/.local/share/nomic.ai/GPT4All/openhands-lm-1.5b-v0.1.i1-Q4_0.gguf";

/// ~1 GB
pub const EXPECTED_MODEL_SIZE: u64 = 1_073_741_824;

/// Name of the primary download source
pub const PRIMARY_SOURCE: &str = "hyperdrive";

pub const CLOUD_SOURCE: &str = "cloud";

/// Default download sources, primary first
pub fn default_sources() -> Vec<DownloadSource> {
    vec![
        DownloadSource {
            name: PRIMARY_SOURCE.to_string(),
            url: format!("hyper://beebee-models/{}", DEFAULT_MODEL_FILE),
        },
        DownloadSource {
            name: CLOUD_SOURCE.to_string(),
            url: format!("https://coherencestream.com/beebeemodel/{}", DEFAULT_MODEL_FILE),
        },
    ]
}

/// Look up a source by name, falling back to the first-listed source
pub fn resolve_source<'a>(sources: &'a [DownloadSource], name: Option<&str>) -> Option<&'a DownloadSource> {
    name.and_then(|n| sources.iter().find(|s| s.name == n))
        .or_else(|| sources.first())
}
