use colored::Colorize;

use crate::config::ApplySummary;
use crate::job::JobStatus;
use crate::release::{Evaluation, ReleaseTargetChanges};
use crate::worker::DrainReport;

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg.red());
}

/// Color a job status the way the target table shows it.
pub fn colored_status(status: JobStatus) -> String {
    let text = status.as_str();
    match status {
        JobStatus::Completed => text.green().to_string(),
        JobStatus::Pending | JobStatus::InProgress => text.blue().to_string(),
        JobStatus::ActionRequired => text.yellow().to_string(),
        JobStatus::Cancelled | JobStatus::Skipped => text.dimmed().to_string(),
        _ => text.red().to_string(),
    }
}

// ─── Manifest Sync ──────────────────────────────────────────────────────────

pub fn print_apply_summary(summary: &ApplySummary) {
    println!();
    println!("{}", "Manifest applied".bold().cyan());
    println!("{}", "─".repeat(40));
    let rows = [
        ("Resources", summary.resources),
        ("Deleted resources", summary.deleted_resources),
        ("Job agents", summary.job_agents),
        ("Environments", summary.environments),
        ("Deployments", summary.deployments),
        ("Versions", summary.versions),
        ("Variables", summary.variables),
        ("Policies", summary.policies),
    ];
    for (label, count) in rows {
        if count > 0 {
            println!("  {:<20} {}", label, count);
        }
    }
}

pub fn print_target_changes(changes: &ReleaseTargetChanges) {
    if changes.is_empty() {
        println!("{}", "Release targets are up-to-date.".dimmed());
        return;
    }
    println!(
        "Release targets: {} added, {} removed.",
        changes.added.len().to_string().green().bold(),
        changes.removed.len().to_string().red().bold()
    );
}

pub fn print_drain_report(report: &DrainReport) {
    if report.failed == 0 {
        print_success(&format!("Processed {} task(s).", report.processed));
    } else {
        print_error(&format!(
            "Processed {} task(s), {} failed. Re-run with --verbose for details.",
            report.processed, report.failed
        ));
    }
}

// ─── Evaluation ─────────────────────────────────────────────────────────────

pub fn print_evaluation(label: &str, evaluation: &Evaluation) {
    match evaluation {
        Evaluation::Missing => {
            println!("  {} {} {}", "?".dimmed(), label.bold(), "no such release target".dimmed());
        }
        Evaluation::NoVersion { rejections } => {
            println!("  {} {} {}", "!".yellow().bold(), label.bold(), "no deployable version".yellow());
            for rejection in rejections {
                println!(
                    "      {} {} ({}): {}",
                    "-".dimmed(),
                    rejection.policy,
                    rejection.rule,
                    rejection.reason.dimmed()
                );
            }
        }
        Evaluation::Unchanged { release } => {
            println!(
                "  {} {} {} {}",
                "=".dimmed(),
                label.bold(),
                "unchanged".dimmed(),
                short_id(&release.id).dimmed()
            );
        }
        Evaluation::Released { release, created, job } => {
            let what = if *created { "released" } else { "job restored" };
            let job_text = job
                .as_ref()
                .map(|j| format!("job {} {}", short_id(&j.id), colored_status(j.status)))
                .unwrap_or_else(|| "no job".dimmed().to_string());
            println!(
                "  {} {} {} {} {}",
                "+".green().bold(),
                label.bold(),
                what.green(),
                short_id(&release.id),
                job_text
            );
        }
    }
}

// ─── Targets ────────────────────────────────────────────────────────────────

/// One line of `stagehand targets`.
#[derive(Debug, Clone)]
pub struct TargetRow {
    pub resource: String,
    pub environment: String,
    pub deployment: String,
    pub version: Option<String>,
    pub job_status: Option<JobStatus>,
}

pub fn print_target_table(rows: &[TargetRow]) {
    if rows.is_empty() {
        println!("{}", "No release targets.".dimmed());
        return;
    }

    println!();
    println!("{}", "Release targets".bold().cyan());
    println!("{}", "─".repeat(96));
    println!(
        "  {:<28} {:<16} {:<20} {:<14} {}",
        "RESOURCE".bold(),
        "ENVIRONMENT".bold(),
        "DEPLOYMENT".bold(),
        "VERSION".bold(),
        "JOB".bold()
    );
    println!("{}", "─".repeat(96));

    for row in rows {
        let version = row
            .version
            .clone()
            .unwrap_or_else(|| "-".dimmed().to_string());
        let status = row
            .job_status
            .map(colored_status)
            .unwrap_or_else(|| "-".dimmed().to_string());
        println!(
            "  {:<28} {:<16} {:<20} {:<14} {}",
            row.resource, row.environment, row.deployment, version, status
        );
    }

    println!();
    println!("  {} release target(s) total.", rows.len());
    println!();
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
