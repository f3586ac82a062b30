pub mod loader;
pub mod manifest;
pub mod types;
pub mod validator;

pub use loader::{load_config, load_manifests, parse_config};
pub use manifest::{apply_manifest, ApplySummary, Manifest};
pub use types::EngineConfig;
