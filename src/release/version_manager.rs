use anyhow::Result;

use crate::policy::{Rejection, RuleContext, RulePipeline};
use crate::state::models::{DeploymentVersion, VersionRelease, VersionStatus};

/// The version a release target should run, if any survived the rules.
#[derive(Debug, Clone)]
pub struct VersionDecision {
    pub chosen: Option<DeploymentVersion>,
    pub rejections: Vec<Rejection>,
}

/// Picks a version for one release target and records it as a version release.
pub struct VersionReleaseManager<'a> {
    ctx: &'a RuleContext<'a>,
    pipeline: &'a RulePipeline,
}

impl<'a> VersionReleaseManager<'a> {
    pub fn new(ctx: &'a RuleContext<'a>, pipeline: &'a RulePipeline) -> Self {
        Self { ctx, pipeline }
    }

    /// Run the pipeline over every ready version of the deployment. The
    /// desired version wins if it survived; otherwise the newest survivor.
    pub async fn evaluate(&self) -> Result<VersionDecision> {
        let candidates: Vec<DeploymentVersion> = self
            .ctx
            .backend
            .list_versions(&self.ctx.deployment.id)
            .await?
            .into_iter()
            .filter(|v| v.status == VersionStatus::Ready)
            .collect();
        if candidates.is_empty() {
            return Ok(VersionDecision {
                chosen: None,
                rejections: vec![],
            });
        }

        let result = self.pipeline.filter_versions(self.ctx, candidates).await?;
        let desired = self.desired_version_id().await?;

        let chosen = desired
            .and_then(|id| result.allowed.iter().find(|v| v.id == id).cloned())
            .or_else(|| newest(&result.allowed).cloned());

        Ok(VersionDecision {
            chosen,
            rejections: result.rejections,
        })
    }

    async fn desired_version_id(&self) -> Result<Option<String>> {
        let target = self.ctx.target;
        if let Some(id) = &target.desired_version_id {
            return Ok(Some(id.clone()));
        }
        let Some(release_id) = &target.desired_release_id else {
            return Ok(None);
        };
        let Some(release) = self.ctx.backend.get_release(release_id).await? else {
            tracing::debug!(release_id = release_id.as_str(), "desired release no longer exists");
            return Ok(None);
        };
        Ok(self
            .ctx
            .backend
            .get_version_release(&release.version_release_id)
            .await?
            .map(|vr| vr.version_id))
    }

    /// Record `version` for the target unless the latest version release
    /// already points at it. Returns the release and whether it is new.
    pub async fn upsert_release(&self, version: &DeploymentVersion) -> Result<(VersionRelease, bool)> {
        let backend = self.ctx.backend;
        let target = self.ctx.target;

        if let Some(latest) = backend.latest_version_release(&target.id).await? {
            if latest.version_id == version.id {
                return Ok((latest, false));
            }
        }

        let release = VersionRelease {
            id: uuid::Uuid::new_v4().to_string(),
            release_target_id: target.id.clone(),
            version_id: version.id.clone(),
            created_at: self.ctx.now,
        };
        backend.insert_version_release(&release).await?;
        tracing::info!(
            release_target = %target.key(),
            version = version.tag.as_str(),
            "new version release"
        );
        Ok((release, true))
    }
}

fn newest(versions: &[DeploymentVersion]) -> Option<&DeploymentVersion> {
    // Stored order breaks ties, so the first of equal timestamps wins.
    versions.iter().reduce(|best, v| {
        if v.created_at > best.created_at {
            v
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn newest_prefers_latest_timestamp_then_first_seen() {
        let now = Utc::now();
        let a = DeploymentVersion::new("d", "a", now);
        let b = DeploymentVersion::new("d", "b", now + Duration::seconds(1));
        let c = DeploymentVersion::new("d", "c", now + Duration::seconds(1));
        let versions = vec![a, b, c];
        assert_eq!(newest(&versions).map(|v| v.tag.as_str()), Some("b"));
        assert!(newest(&[]).is_none());
    }
}
