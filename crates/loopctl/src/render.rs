//! Output rendering for loopctl.

use loop_core::types::{Run, RunStatus, Unit, UnitStatus};

pub fn print_run_created(run: &Run) {
    println!("Started run: {}", run.id);
    println!("  Workspace: {}", run.workspace_root);
    println!("  Specs:     {}", run.specs_dir);
    println!("  Units:     {}", run.total_units);
    println!("  Status:    {}", format_run_status(run.status));
}

pub fn print_run_list(runs: &[Run]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!("{:<36}  {:<10}  {:<8}  {:<20}", "ID", "STATUS", "UNITS", "CREATED");
    println!("{}", "-".repeat(80));

    for run in runs {
        println!(
            "{:<36}  {:<10}  {:<8}  {:<20}",
            run.id.0,
            format_run_status(run.status),
            format!("{}/{}", run.completed_units, run.total_units),
            format_time(&run.created_at),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

pub fn print_run_details(run: &Run, units: &[Unit]) {
    println!("Run: {}", run.id);
    println!();
    println!("  Status:     {}", format_run_status(run.status));
    println!("  Workspace:  {}", run.workspace_root);
    println!("  Specs dir:  {}", run.specs_dir);
    if let Some(ref err) = run.error {
        println!("  Error:      {err}");
    }
    println!("  Created:    {}", format_time(&run.created_at));
    println!("  Updated:    {}", format_time(&run.updated_at));
    println!(
        "  Units:      {} total, {} merged, {} failed, {} blocked",
        run.total_units, run.completed_units, run.failed_units, run.blocked_units
    );

    if units.is_empty() {
        return;
    }

    println!();
    println!("  Units:");
    println!("    {:<28}  {:<12}  {:<5}  {}", "KEY", "STATUS", "LEVEL", "BRANCH");
    println!("    {}", "-".repeat(90));
    for unit in units {
        println!(
            "    {:<28}  {:<12}  {:<5}  {}",
            truncate(&unit.unit_key, 28),
            format_unit_status(unit.status),
            unit.level,
            unit.branch.as_deref().unwrap_or("-"),
        );
    }
}

fn format_run_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
        RunStatus::Stopped => "STOPPED",
    }
}

fn format_unit_status(status: UnitStatus) -> &'static str {
    match status {
        UnitStatus::Pending => "PENDING",
        UnitStatus::Ready => "READY",
        UnitStatus::InProgress => "IN_PROGRESS",
        UnitStatus::Blocked => "BLOCKED",
        UnitStatus::PrOpen => "PR_OPEN",
        UnitStatus::InReview => "IN_REVIEW",
        UnitStatus::Merging => "MERGING",
        UnitStatus::Merged => "MERGED",
        UnitStatus::Failed => "FAILED",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_strings_alone() {
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn truncate_adds_ellipsis_to_long_strings() {
        assert_eq!(truncate("a-very-long-unit-key-name", 10), "a-very-...");
    }
}
