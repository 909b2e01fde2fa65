use solace_core::DrainReport;

use crate::commands::common::{short_id, App};
use crate::error::CliError;

pub fn format_drain_report(report: &DrainReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Synced {}, failed {}, still queued {}",
        report.succeeded.len(),
        report.failed.len(),
        report.still_queued
    )];
    for letter in &report.failed {
        lines.push(format!(
            "  #{} {}  {}",
            letter.write.seq,
            short_id(&letter.write.target().to_string()),
            letter.reason
        ));
    }
    lines
}

pub async fn run_sync(app: &App) -> Result<(), CliError> {
    let report = app.engine.retry_sync().await?;
    for line in format_drain_report(&report) {
        println!("{line}");
    }
    Ok(())
}
