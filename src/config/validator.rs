use anyhow::{bail, Result};
use std::collections::HashSet;

use super::manifest::Manifest;
use super::types::EngineConfig;
use crate::error::EngineError;
use crate::policy::rules::PolicyRules;
use crate::selector::condition::Condition;

/// Longest span a policy rule may name: a century.
const MAX_RULE_SECONDS: i64 = 100 * 365 * 24 * 3600;

/// Reject settings the engine cannot run with.
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.workspace.trim().is_empty() {
        return Err(EngineError::Config("workspace must not be empty".into()).into());
    }
    if config.worker.parallelism == 0 {
        return Err(EngineError::Config("worker.parallelism must be at least 1".into()).into());
    }
    if config.lock.ttl_seconds == 0 {
        return Err(EngineError::Config("lock.ttl_seconds must be at least 1".into()).into());
    }
    if config.lock.poll_interval() >= config.lock.ttl() {
        return Err(EngineError::Config(format!(
            "lock.poll_interval_ms ({}) must be shorter than lock.ttl_seconds ({}s)",
            config.lock.poll_interval_ms, config.lock.ttl_seconds
        ))
        .into());
    }
    if config.dispatch.max_attempts == 0 {
        return Err(EngineError::Config("dispatch.max_attempts must be at least 1".into()).into());
    }
    Ok(())
}

/// Check a merged manifest set for duplicates, dangling agent names and
/// over-deep selectors before anything is written.
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    let mut identifiers = HashSet::new();
    for resource in &manifest.resources {
        if !identifiers.insert(resource.identifier.as_str()) {
            bail!(
                "Duplicate resource '{}' found across manifest files. Identifiers must be unique.",
                resource.identifier
            );
        }
    }

    let mut agents = HashSet::new();
    for agent in &manifest.job_agents {
        if !agents.insert(agent.name.as_str()) {
            bail!("Duplicate job agent '{}'", agent.name);
        }
    }

    let mut systems = HashSet::new();
    for system in &manifest.systems {
        if !systems.insert(system.name.as_str()) {
            bail!(
                "Duplicate system '{}' found across manifest files. System names must be unique.",
                system.name
            );
        }

        let mut environments = HashSet::new();
        for env in &system.environments {
            if !environments.insert(env.name.as_str()) {
                bail!("System '{}' declares environment '{}' twice", system.name, env.name);
            }
            check_selector(&env.resource_selector, &format!("environment '{}'", env.name))?;
        }

        let mut deployments = HashSet::new();
        for dep in &system.deployments {
            let slug = dep.slug.as_deref().unwrap_or(&dep.name);
            if !deployments.insert(slug) {
                bail!("System '{}' declares deployment '{}' twice", system.name, slug);
            }
            check_selector(&dep.resource_selector, &format!("deployment '{}'", slug))?;
            if let Some(agent) = &dep.job_agent {
                if !agents.contains(agent.as_str()) {
                    bail!(
                        "Deployment '{}' uses job agent '{}', which does not exist",
                        slug,
                        agent
                    );
                }
            }

            let mut tags = HashSet::new();
            for version in &dep.versions {
                if !tags.insert(version.tag.as_str()) {
                    bail!("Deployment '{}' declares version '{}' twice", slug, version.tag);
                }
            }

            let mut keys = HashSet::new();
            for variable in &dep.variables {
                if !keys.insert(variable.key.as_str()) {
                    bail!("Deployment '{}' declares variable '{}' twice", slug, variable.key);
                }
                for value in &variable.values {
                    check_selector(
                        &value.resource_selector,
                        &format!("variable '{}' of deployment '{}'", variable.key, slug),
                    )?;
                }
            }
        }
    }

    let mut policies = HashSet::new();
    for policy in &manifest.policies {
        if !policies.insert(policy.name.as_str()) {
            bail!("Duplicate policy '{}'", policy.name);
        }
        let owner = format!("policy '{}'", policy.name);
        for target in &policy.targets {
            check_selector(&target.deployment_selector, &owner)?;
            check_selector(&target.environment_selector, &owner)?;
            check_selector(&target.resource_selector, &owner)?;
        }
        check_rules(&policy.rules, &owner)?;
    }
    Ok(())
}

fn check_rules(rules: &PolicyRules, owner: &str) -> Result<()> {
    if let Some(window) = &rules.deployment_window {
        if let Err(e) = window.validate() {
            bail!("Deployment window of {} is invalid: {}", owner, e);
        }
        check_span(window.duration_minutes.checked_mul(60), "deployment window duration", owner)?;
    }
    if let Some(cooldown) = &rules.version_cooldown {
        check_span(Some(cooldown.interval_seconds), "version cooldown interval", owner)?;
    }
    if let Some(rollout) = &rules.gradual_rollout {
        check_span(
            Some(rollout.time_scale_interval_seconds),
            "gradual rollout interval",
            owner,
        )?;
    }
    if let Some(progression) = &rules.environment_progression {
        check_span(
            progression.minimum_soak_minutes.checked_mul(60),
            "environment progression soak time",
            owner,
        )?;
        if let Some(hours) = progression.maximum_age_hours {
            check_span(hours.checked_mul(3600), "environment progression maximum age", owner)?;
        }
    }
    Ok(())
}

fn check_span(seconds: Option<i64>, what: &str, owner: &str) -> Result<()> {
    match seconds {
        Some(s) if (0..=MAX_RULE_SECONDS).contains(&s) => Ok(()),
        _ => bail!(
            "The {} of {} must be between 0 and {} seconds",
            what,
            owner,
            MAX_RULE_SECONDS
        ),
    }
}

fn check_selector(selector: &Option<Condition>, owner: &str) -> Result<()> {
    if let Some(condition) = selector {
        if let Err(e) = condition.validate() {
            bail!("Selector of {} is invalid: {}", owner, e);
        }
    }
    Ok(())
}
