use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::rules::{
    AnyApprovalRule, DeploymentDependencyRule, DeploymentWindowRule, GradualRolloutRule,
    RollbackRule, VersionCooldownRule, VersionSelectorRule,
};
use super::{RuleContext, RuleOutcome, VersionRule};
use crate::clock::shift_seconds;
use crate::state::models::{ApprovalStatus, DeploymentVersion};

// ─── Version Selector ───────────────────────────────────────────────────────

pub struct SelectorFilter(pub VersionSelectorRule);

#[async_trait]
impl VersionRule for SelectorFilter {
    fn name(&self) -> &'static str {
        "version_selector"
    }

    async fn filter(
        &self,
        _ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        Ok(RuleOutcome::retain(candidates, |version| {
            (!self.0.selector.matches(version)).then(|| "does not match version selector".into())
        }))
    }
}

// ─── Deployment Dependency ──────────────────────────────────────────────────

/// Holds everything back until the same resource runs a qualifying version
/// of the upstream deployment.
pub struct DependencyGate(pub DeploymentDependencyRule);

#[async_trait]
impl VersionRule for DependencyGate {
    fn name(&self) -> &'static str {
        "deployment_dependency"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        let upstream = ctx
            .backend
            .latest_successful_version(&ctx.resource.id, &self.0.depends_on_deployment_id)
            .await?;
        let Some(upstream) = upstream else {
            return Ok(RuleOutcome::block(format!(
                "deployment {} has not succeeded on this resource",
                self.0.depends_on_deployment_id
            )));
        };
        if let Some(selector) = &self.0.version_selector {
            if !selector.matches(&upstream) {
                return Ok(RuleOutcome::block(format!(
                    "upstream version {} does not qualify",
                    upstream.tag
                )));
            }
        }
        Ok(RuleOutcome::pass(candidates))
    }
}

// ─── Deployment Window ──────────────────────────────────────────────────────

pub struct WindowGate(pub DeploymentWindowRule);

#[async_trait]
impl VersionRule for WindowGate {
    fn name(&self) -> &'static str {
        "deployment_window"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        match self.0.blocks(ctx.now) {
            Ok(false) => Ok(RuleOutcome::pass(candidates)),
            Ok(true) => Ok(RuleOutcome::block("outside the deployment window")),
            Err(e) => {
                tracing::warn!(error = %e, "deployment window could not be evaluated");
                Ok(RuleOutcome::block(format!("invalid deployment window: {}", e)))
            }
        }
    }
}

// ─── Version Cooldown ───────────────────────────────────────────────────────

/// After a version change, only the current version is allowed until the
/// interval has passed.
pub struct CooldownGate(pub VersionCooldownRule);

#[async_trait]
impl VersionRule for CooldownGate {
    fn name(&self) -> &'static str {
        "version_cooldown"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        let Some(last) = ctx.backend.latest_version_release(&ctx.target.id).await? else {
            return Ok(RuleOutcome::pass(candidates));
        };
        // An interval past chrono's range never ends.
        let ready_at = shift_seconds(last.created_at, self.0.interval_seconds.max(0));
        if ready_at.is_some_and(|at| ctx.now >= at) {
            return Ok(RuleOutcome::pass(candidates));
        }
        let until = ready_at.map_or_else(|| "indefinitely".to_string(), |at| format!("until {}", at));
        Ok(RuleOutcome::retain(candidates, |version| {
            (version.id != last.version_id).then(|| format!("cooling down {}", until))
        }))
    }
}

// ─── Gradual Rollout ────────────────────────────────────────────────────────

/// Position of `target_id` in the version's deterministic rollout order.
pub fn rollout_rank(version_id: &str, target_id: &str, all_target_ids: &[String]) -> usize {
    let hash = |id: &str| hex::encode(Sha256::digest(format!("{}{}", version_id, id).as_bytes()));
    let mut order: Vec<(String, &str)> = all_target_ids
        .iter()
        .map(|id| (hash(id), id.as_str()))
        .collect();
    order.sort();
    order
        .iter()
        .position(|(_, id)| *id == target_id)
        .unwrap_or(order.len())
}

/// Admits the n-th target (in hash order) `n * interval` after the version
/// was created.
pub struct RolloutGate(pub GradualRolloutRule);

#[async_trait]
impl VersionRule for RolloutGate {
    fn name(&self) -> &'static str {
        "gradual_rollout"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        let peers: Vec<String> = ctx
            .backend
            .list_release_targets_for(&ctx.environment.id, &ctx.deployment.id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let interval = self.0.time_scale_interval_seconds.max(0);

        Ok(RuleOutcome::retain(candidates, |version| {
            let rank = rollout_rank(&version.id, &ctx.target.id, &peers) as i64;
            let admitted_at = rank
                .checked_mul(interval)
                .and_then(|offset| shift_seconds(version.created_at, offset));
            match admitted_at {
                Some(at) if ctx.now >= at => None,
                Some(at) => Some(format!("rollout reaches this target at {}", at)),
                None => Some("rollout never reaches this target".to_string()),
            }
        }))
    }
}

// ─── Approvals ──────────────────────────────────────────────────────────────

pub struct ApprovalGate(pub AnyApprovalRule);

#[async_trait]
impl VersionRule for ApprovalGate {
    fn name(&self) -> &'static str {
        "any_approval"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        let mut allowed = Vec::new();
        let mut reasons = Vec::new();
        for version in candidates {
            let records = ctx
                .backend
                .list_approvals(&version.id, &ctx.environment.id)
                .await?;
            let rejected = records
                .iter()
                .any(|r| r.status == ApprovalStatus::Rejected);
            let approved = records
                .iter()
                .filter(|r| r.status == ApprovalStatus::Approved)
                .count();
            if rejected {
                reasons.push(format!("{}: rejected", version.tag));
            } else if approved < self.0.min_approvals as usize {
                reasons.push(format!(
                    "{}: {}/{} approvals",
                    version.tag, approved, self.0.min_approvals
                ));
            } else {
                allowed.push(version);
            }
        }
        Ok(RuleOutcome {
            allowed,
            reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        })
    }
}

// ─── Rollback ───────────────────────────────────────────────────────────────

/// Drops versions whose latest job on this target ended badly, so the
/// target falls back to an older version.
pub struct RollbackFilter(pub RollbackRule);

#[async_trait]
impl VersionRule for RollbackFilter {
    fn name(&self) -> &'static str {
        "rollback"
    }

    async fn filter(
        &self,
        ctx: &RuleContext<'_>,
        candidates: Vec<DeploymentVersion>,
    ) -> Result<RuleOutcome> {
        let latest = ctx.backend.latest_job_status_by_version(&ctx.target.id).await?;
        Ok(RuleOutcome::retain(candidates, |version| {
            latest
                .get(&version.id)
                .filter(|status| self.0.rollback_on_job_statuses.contains(*status))
                .map(|status| format!("rolled back after {}", status))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_rank_is_a_permutation() {
        let ids: Vec<String> = (0..8).map(|i| format!("target-{}", i)).collect();
        let mut ranks: Vec<usize> = ids.iter().map(|id| rollout_rank("v1", id, &ids)).collect();
        ranks.sort();
        assert_eq!(ranks, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn rollout_rank_depends_on_version() {
        let ids: Vec<String> = (0..16).map(|i| format!("target-{}", i)).collect();
        let a: Vec<usize> = ids.iter().map(|id| rollout_rank("v1", id, &ids)).collect();
        let b: Vec<usize> = ids.iter().map(|id| rollout_rank("v2", id, &ids)).collect();
        assert_ne!(a, b);
    }
}
