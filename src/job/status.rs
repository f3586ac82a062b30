use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Lifecycle of a single dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    /// Waiting on a human; may go back to in-progress.
    ActionRequired,
    Completed,
    Failure,
    Cancelled,
    Skipped,
    InvalidJobAgent,
    InvalidIntegration,
    ExternalRunNotFound,
}

pub const ALL_STATUSES: [JobStatus; 10] = [
    JobStatus::Pending,
    JobStatus::InProgress,
    JobStatus::ActionRequired,
    JobStatus::Completed,
    JobStatus::Failure,
    JobStatus::Cancelled,
    JobStatus::Skipped,
    JobStatus::InvalidJobAgent,
    JobStatus::InvalidIntegration,
    JobStatus::ExternalRunNotFound,
];

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::ActionRequired => "action_required",
            JobStatus::Completed => "completed",
            JobStatus::Failure => "failure",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
            JobStatus::InvalidJobAgent => "invalid_job_agent",
            JobStatus::InvalidIntegration => "invalid_integration",
            JobStatus::ExternalRunNotFound => "external_run_not_found",
        }
    }

    /// Terminal statuses.
    pub fn is_exited(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failure
                | JobStatus::Cancelled
                | JobStatus::Skipped
                | JobStatus::InvalidJobAgent
                | JobStatus::InvalidIntegration
                | JobStatus::ExternalRunNotFound
        )
    }

    /// The retryable subset of exited statuses.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            JobStatus::Failure
                | JobStatus::InvalidJobAgent
                | JobStatus::InvalidIntegration
                | JobStatus::ExternalRunNotFound
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            JobStatus::Pending => true,
            JobStatus::InProgress => next != JobStatus::Pending,
            JobStatus::ActionRequired => next == JobStatus::InProgress || next.is_exited(),
            _ => false,
        }
    }

    pub fn check_transition(&self, next: JobStatus) -> Result<(), EngineError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown job status '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_is_a_subset_of_exited() {
        for status in ALL_STATUSES {
            if status.is_failed() {
                assert!(status.is_exited(), "{status} is failed but not exited");
            }
        }
    }

    #[test]
    fn exited_jobs_are_frozen() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::InProgress));
        assert!(!JobStatus::Failure.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Failure.can_transition_to(JobStatus::Failure));
    }

    #[test]
    fn action_required_is_in_flight() {
        assert!(!JobStatus::ActionRequired.is_exited());
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::ActionRequired));
        assert!(JobStatus::ActionRequired.can_transition_to(JobStatus::InProgress));
        assert!(!JobStatus::InProgress.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn parses_wire_names() {
        for status in ALL_STATUSES {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }
}
