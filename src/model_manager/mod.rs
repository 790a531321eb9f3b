//! Model Availability
//!
//! Answers "is the model artifact on disk, and where would it come from?".
//! Nothing here loads or downloads a model.
//!
//! Module structure:
//! - types.rs: ModelDescriptor, DownloadDescriptor, DownloadSource
//! - registry.rs: Default artifact name, path, size and download sources
//! - manager.rs: ModelAvailability probe

pub mod types;
pub mod registry;
pub mod manager;

pub use types::{DownloadDescriptor, DownloadSource, ModelDescriptor};
pub use registry::{default_sources, PRIMARY_SOURCE};
pub use manager::ModelAvailability;
