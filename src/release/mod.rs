pub mod target_manager;
pub mod variable_manager;
pub mod version_manager;

pub use target_manager::{Evaluation, ReleaseTargetChanges, ReleaseTargetManager};
pub use variable_manager::VariableReleaseManager;
pub use version_manager::{VersionDecision, VersionReleaseManager};
