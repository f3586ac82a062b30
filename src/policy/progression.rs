use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::rules::EnvironmentProgressionRule;
use super::{RuleContext, RuleOutcome, VersionRule};
use crate::clock::shift_seconds;
use crate::state::models::{DeploymentVersion, TargetJobOutcome};

/// A version is promoted only after it has done well enough, for long enough,
/// in a prerequisite environment.
pub struct EnvironmentProgressionGate(pub EnvironmentProgressionRule);

/// Summary of a version's results in the prerequisite environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressionStats {
    pub total_targets: usize,
    pub successes: usize,
    pub latest_success: Option<DateTime<Utc>>,
}

impl ProgressionStats {
    pub fn success_percentage(&self) -> f64 {
        if self.total_targets == 0 {
            return 0.0;
        }
        self.successes as f64 * 100.0 / self.total_targets as f64
    }
}

impl EnvironmentProgressionRule {
    pub fn stats(
        &self,
        total_targets: usize,
        outcomes: &[TargetJobOutcome],
        now: DateTime<Utc>,
    ) -> ProgressionStats {
        // An age limit past chrono's range does not limit anything.
        let oldest_allowed = self
            .maximum_age_hours
            .and_then(|h| h.checked_mul(-3600))
            .and_then(|offset| shift_seconds(now, offset));
        let successes: Vec<DateTime<Utc>> = outcomes
            .iter()
            .filter(|o| self.success_statuses.contains(&o.status))
            .filter_map(|o| o.completed_at)
            .filter(|at| oldest_allowed.map_or(true, |oldest| *at >= oldest))
            .collect();
        ProgressionStats {
            total_targets,
            successes: successes.len(),
            latest_success: successes.iter().max().copied(),
        }
    }

    /// `None` when the version may progress, else why not.
    pub fn judge(&self, stats: &ProgressionStats, now: DateTime<Utc>) -> Option<String> {
        if stats.total_targets == 0 {
            return Some("prerequisite environment has no release targets".into());
        }
        let pct = stats.success_percentage();
        if pct < self.minimum_success_percentage {
            return Some(format!(
                "{:.0}% succeeded in prerequisite environment, need {:.0}%",
                pct, self.minimum_success_percentage
            ));
        }
        if self.minimum_soak_minutes > 0 {
            let Some(latest) = stats.latest_success else {
                return Some("no successful job to soak".into());
            };
            let soaked_at = self
                .minimum_soak_minutes
                .checked_mul(60)
                .and_then(|offset| shift_seconds(latest, offset));
            match soaked_at {
                Some(at) if now < at => return Some(format!("soaking until {}", at)),
                None => return Some("soaking indefinitely".into()),
                _ => {}
            }
        }
        None
    }
}

#[async_trait]
impl VersionRule for EnvironmentProgressionGate {
    fn name(&self) -> &'static str {
        "environment_progression"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        let rule = &self.0;
        let total = ctx
            .backend
            .list_release_targets_for(&rule.depends_on_environment_id, &ctx.deployment.id)
            .await?
            .len();

        let mut verdicts = Vec::with_capacity(candidates.len());
        for version in &candidates {
            let outcomes = ctx
                .backend
                .version_job_outcomes(&rule.depends_on_environment_id, &ctx.deployment.id, &version.id)
                .await?;
            let stats = rule.stats(total, &outcomes, ctx.now);
            verdicts.push(rule.judge(&stats, ctx.now));
        }

        let mut verdicts = verdicts.into_iter();
        Ok(RuleOutcome::retain(candidates, |_| verdicts.next().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::status::JobStatus;
    use chrono::Duration;

    fn rule(pct: f64, soak: i64) -> EnvironmentProgressionRule {
        EnvironmentProgressionRule {
            depends_on_environment_id: "staging".into(),
            minimum_success_percentage: pct,
            minimum_soak_minutes: soak,
            maximum_age_hours: None,
            success_statuses: vec![JobStatus::Completed],
        }
    }

    fn outcome(status: JobStatus, at: DateTime<Utc>) -> TargetJobOutcome {
        TargetJobOutcome {
            release_target_id: uuid::Uuid::new_v4().to_string(),
            status,
            completed_at: Some(at),
        }
    }

    #[test]
    fn percentage_threshold() {
        let now = Utc::now();
        let outcomes = vec![
            outcome(JobStatus::Completed, now),
            outcome(JobStatus::Failure, now),
        ];
        let r = rule(50.0, 0);
        assert_eq!(r.judge(&r.stats(2, &outcomes, now), now), None);
        let strict = rule(75.0, 0);
        assert!(strict.judge(&strict.stats(2, &outcomes, now), now).is_some());
    }

    #[test]
    fn soak_time_counts_from_latest_success() {
        let now = Utc::now();
        let outcomes = vec![outcome(JobStatus::Completed, now - Duration::minutes(10))];
        assert!(rule(100.0, 30).judge(&rule(100.0, 30).stats(1, &outcomes, now), now).is_some());
        assert!(rule(100.0, 5).judge(&rule(100.0, 5).stats(1, &outcomes, now), now).is_none());
    }

    #[test]
    fn stale_successes_are_ignored() {
        let now = Utc::now();
        let mut r = rule(100.0, 0);
        r.maximum_age_hours = Some(1);
        let outcomes = vec![outcome(JobStatus::Completed, now - Duration::hours(3))];
        assert_eq!(r.stats(1, &outcomes, now).successes, 0);
    }

    #[test]
    fn out_of_range_durations_do_not_panic() {
        let now = Utc::now();
        let outcomes = vec![outcome(JobStatus::Completed, now - Duration::minutes(10))];
        let mut r = rule(100.0, i64::MAX);
        r.maximum_age_hours = Some(i64::MAX);
        let stats = r.stats(1, &outcomes, now);
        assert_eq!(stats.successes, 1);
        assert_eq!(r.judge(&stats, now).as_deref(), Some("soaking indefinitely"));
    }
}
