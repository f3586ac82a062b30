pub mod agent;
pub mod backoff;
pub mod manager;
pub mod merge;
pub mod status;

pub use agent::{AgentRegistry, DispatchRequest, JobAgentAdapter, WebhookAgent};
pub use manager::{JobExit, JobManager};
pub use status::JobStatus;
